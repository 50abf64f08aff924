//! Windows location provider backed by the WinRT `Geolocator`.
//!
//! `RequestAccessAsync` doubles as the permission prompt on Windows; its
//! answer is cached so later cycles skip straight to the fix. Each started
//! update stream is a single one-shot `GetGeopositionAsync` acquisition on
//! its own thread.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use log::warn;
use windows::Devices::Geolocation::{GeolocationAccessStatus, Geolocator};

use crate::provider::{AuthorizationStatus, LocationProvider, ProviderDelegate, ProviderEvent};
use crate::{FetchError, FetchResult, Location, unix_time_ms};

// WinRT DateTime counts 100ns ticks from 1601-01-01.
const FILETIME_UNIX_OFFSET_MS: i64 = 11_644_473_600_000;

/// Location provider backed by `Windows.Devices.Geolocation`.
#[derive(Default)]
pub struct GeolocatorProvider {
    delegate: Mutex<Option<Arc<dyn ProviderDelegate>>>,
    status: Arc<Mutex<AuthorizationStatus>>,
}

impl fmt::Debug for GeolocatorProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeolocatorProvider").finish()
    }
}

impl GeolocatorProvider {
    /// Constructs a provider. No WinRT calls happen until authorization is
    /// requested or updates are started.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn delegate(&self) -> Option<Arc<dyn ProviderDelegate>> {
        self.delegate.lock().expect("delegate mutex poisoned").clone()
    }
}

impl LocationProvider for GeolocatorProvider {
    fn set_delegate(&self, delegate: Arc<dyn ProviderDelegate>) {
        *self.delegate.lock().expect("delegate mutex poisoned") = Some(delegate);
    }

    fn authorization_status(&self) -> AuthorizationStatus {
        *self.status.lock().expect("status mutex poisoned")
    }

    fn request_authorization(&self) {
        let delegate = self.delegate();
        let status = Arc::clone(&self.status);
        let spawned = thread::Builder::new()
            .name("locfetch-geolocator-auth".into())
            .spawn(move || {
                let event = match request_access() {
                    Ok(answer) => {
                        *status.lock().expect("status mutex poisoned") = answer;
                        ProviderEvent::Authorization(answer)
                    }
                    Err(reason) => ProviderEvent::Failure(reason),
                };
                if let Some(delegate) = delegate {
                    delegate.on_event(event);
                }
            });
        if let Err(err) = spawned {
            warn!("failed to spawn authorization thread: {err}");
        }
    }

    fn start_updates(&self) -> FetchResult<()> {
        let delegate = self
            .delegate()
            .ok_or_else(|| FetchError::ProviderUnavailable("no delegate registered".into()))?;

        thread::Builder::new()
            .name("locfetch-geolocator".into())
            .spawn(move || {
                let event = match acquire() {
                    Ok(fix) => ProviderEvent::Update(fix),
                    Err(reason) => ProviderEvent::Failure(reason),
                };
                delegate.on_event(event);
            })
            .map_err(|e| {
                FetchError::ProviderUnavailable(format!("failed to spawn update thread: {e}"))
            })?;
        Ok(())
    }

    fn stop_updates(&self) {
        // One-shot acquisition; the thread exits on its own.
    }
}

fn request_access() -> Result<AuthorizationStatus, String> {
    let access = Geolocator::RequestAccessAsync()
        .map_err(|e| e.message().to_string())?
        .get()
        .map_err(|e| e.message().to_string())?;

    match access {
        GeolocationAccessStatus::Allowed => Ok(AuthorizationStatus::Granted),
        GeolocationAccessStatus::Denied => Ok(AuthorizationStatus::Denied),
        _ => Err("geolocation access unspecified".to_string()),
    }
}

fn acquire() -> Result<Location, String> {
    let geolocator = Geolocator::new().map_err(|e| e.message().to_string())?;

    let position = geolocator
        .GetGeopositionAsync()
        .map_err(|e| e.message().to_string())?
        .get()
        .map_err(|e| e.message().to_string())?;

    let coord = position.Coordinate().map_err(|e| e.message().to_string())?;
    let point = coord.Point().map_err(|e| e.message().to_string())?;
    let pos = point.Position().map_err(|e| e.message().to_string())?;

    let timestamp = coord
        .Timestamp()
        .map(|t| universal_time_to_unix_ms(t.UniversalTime))
        .unwrap_or_else(|_| unix_time_ms());
    let accuracy = coord.Accuracy().ok();

    Ok(Location {
        latitude: pos.Latitude,
        longitude: pos.Longitude,
        altitude: Some(pos.Altitude),
        horizontal_accuracy: accuracy,
        vertical_accuracy: None,
        timestamp,
    })
}

fn universal_time_to_unix_ms(universal_time: i64) -> u64 {
    (universal_time / 10_000 - FILETIME_UNIX_OFFSET_MS).max(0) as u64
}
