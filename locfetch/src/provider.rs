//! The narrow interface through which the coordinator consumes a platform
//! location provider.
//!
//! Concrete backends live in [`crate::sys`]; tests and embedders can
//! substitute their own implementation via
//! [`LocationFetcher::with_provider`](crate::LocationFetcher::with_provider).

use std::sync::Arc;

use crate::{FetchResult, Location};

/// Authorization state of location access for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthorizationStatus {
    /// The user has not been asked yet.
    #[default]
    NotDetermined,
    /// Access has been granted.
    Granted,
    /// The user refused access.
    Denied,
    /// Access is restricted by platform policy (e.g. parental controls).
    Restricted,
}

/// An event emitted by a [`LocationProvider`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// The authorization state changed, or a pending authorization request
    /// was answered.
    Authorization(AuthorizationStatus),
    /// A new fix arrived on the update stream.
    Update(Location),
    /// The provider failed before delivering a usable fix.
    Failure(String),
}

/// Receives [`ProviderEvent`]s from a provider.
///
/// Events arrive on whatever thread the platform delivers them on.
pub trait ProviderDelegate: Send + Sync {
    /// Called for every event the provider emits.
    fn on_event(&self, event: ProviderEvent);
}

/// A platform location provider: authorization queries plus a start/stop
/// update stream that delivers events through a [`ProviderDelegate`].
pub trait LocationProvider: Send + Sync {
    /// Registers the delegate that receives this provider's events.
    fn set_delegate(&self, delegate: Arc<dyn ProviderDelegate>);

    /// The current authorization state, queried without prompting the user.
    fn authorization_status(&self) -> AuthorizationStatus;

    /// Asks the platform for location authorization.
    ///
    /// The answer arrives asynchronously as a
    /// [`ProviderEvent::Authorization`] event.
    fn request_authorization(&self);

    /// Starts the update stream.
    ///
    /// # Errors
    /// Returns an error if the stream cannot be started; the stream is not
    /// running afterwards.
    fn start_updates(&self) -> FetchResult<()>;

    /// Stops the update stream. Idempotent.
    fn stop_updates(&self);
}
