//! One-shot device location fetching.
//!
//! This crate answers a single question: where is this device right now?
//! A process-wide [`LocationFetcher`] wraps the platform location provider,
//! runs at most one acquisition cycle at a time, and resolves every caller
//! waiting on that cycle with the same fix or the same failure. The provider
//! is stopped between cycles to conserve power.
//!
//! ```no_run
//! # async fn demo() {
//! use locfetch::LocationFetcher;
//!
//! match LocationFetcher::shared().fetch_current_location().await {
//!     Ok(location) => println!("{}, {}", location.latitude, location.longitude),
//!     Err(err) => eprintln!("no fix: {err}"),
//! }
//! # }
//! ```

#![warn(missing_docs)]

mod coordinator;
pub mod provider;
/// Platform-specific provider implementations.
pub mod sys;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use coordinator::LocationFetcher;
pub use provider::{AuthorizationStatus, LocationProvider, ProviderDelegate, ProviderEvent};

/// A geographic fix with coordinates and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees (-90 to 90).
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180).
    pub longitude: f64,
    /// Altitude in meters above sea level, if available.
    pub altitude: Option<f64>,
    /// Horizontal accuracy in meters, if available.
    pub horizontal_accuracy: Option<f64>,
    /// Vertical accuracy in meters, if available.
    pub vertical_accuracy: Option<f64>,
    /// Timestamp as Unix epoch milliseconds.
    pub timestamp: u64,
}

/// Errors that can resolve a fetch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The user refused location access.
    #[error("location authorization denied")]
    AuthorizationDenied,
    /// Location access is restricted by platform policy (e.g. parental
    /// controls); treated like a denial, but distinguishable.
    #[error("location authorization restricted")]
    AuthorizationRestricted,
    /// The positioning service failed before delivering a usable fix.
    #[error("location provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// No usable fix arrived within the configured window.
    #[error("timed out waiting for a location fix")]
    Timeout,
}

/// Convenience alias for fetch outcomes.
pub type FetchResult<T> = Result<T, FetchError>;

/// Policy knobs for a fetch cycle.
///
/// The defaults suit a hand-held device: a cold start can take several
/// seconds to produce a first fix, and a fix from the last minute still
/// counts as "now" for a one-shot query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// How long a cycle may run, authorization wait included, before it
    /// fails with [`FetchError::Timeout`].
    pub timeout: Duration,
    /// Updates older than this are treated as cached values and discarded.
    pub maximum_fix_age: Duration,
    /// Updates reporting a horizontal accuracy coarser than this many
    /// meters are discarded. Updates that report no accuracy pass the bar.
    pub accuracy_threshold: f64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            maximum_fix_age: Duration::from_secs(60),
            accuracy_threshold: 100.0,
        }
    }
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
