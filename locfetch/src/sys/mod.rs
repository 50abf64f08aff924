//! Platform-specific location providers.

use std::sync::Arc;

use crate::provider::LocationProvider;

/// Linux provider backed by the GeoClue2 D-Bus service.
#[cfg(target_os = "linux")]
pub mod linux;

/// Windows provider backed by the WinRT `Geolocator`.
#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "linux")]
pub(crate) fn default_provider() -> Arc<dyn LocationProvider> {
    Arc::new(linux::GeoClueProvider::new())
}

#[cfg(target_os = "windows")]
pub(crate) fn default_provider() -> Arc<dyn LocationProvider> {
    Arc::new(windows::GeolocatorProvider::new())
}

// Fallback for unsupported platforms: cycles fail fast in start_updates.
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub(crate) fn default_provider() -> Arc<dyn LocationProvider> {
    Arc::new(unsupported::UnsupportedProvider)
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
mod unsupported {
    use std::sync::Arc;

    use crate::provider::{AuthorizationStatus, LocationProvider, ProviderDelegate};
    use crate::{FetchError, FetchResult};

    /// Compile-time stub for platforms without a provider implementation.
    #[derive(Debug)]
    pub(super) struct UnsupportedProvider;

    impl LocationProvider for UnsupportedProvider {
        fn set_delegate(&self, _delegate: Arc<dyn ProviderDelegate>) {}

        fn authorization_status(&self) -> AuthorizationStatus {
            // Claiming granted lets the cycle reach start_updates and fail
            // there instead of waiting out the authorization timeout.
            AuthorizationStatus::Granted
        }

        fn request_authorization(&self) {}

        fn start_updates(&self) -> FetchResult<()> {
            Err(FetchError::ProviderUnavailable(
                "no location provider on this platform".into(),
            ))
        }

        fn stop_updates(&self) {}
    }
}
