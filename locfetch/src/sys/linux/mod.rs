//! Linux location provider backed by the GeoClue2 D-Bus service.
//!
//! Access mediation is GeoClue's job (via its agent); traditional Linux has
//! no runtime permission prompt, so authorization always reads as granted
//! and any policy refusal surfaces as a client start failure instead.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::{FutureExt, select};
use futures_timer::Delay;
use log::{debug, warn};
use zbus::Connection;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::provider::{AuthorizationStatus, LocationProvider, ProviderDelegate, ProviderEvent};
use crate::{FetchError, FetchResult, Location, unix_time_ms};

const BUS_NAME: &str = "org.freedesktop.GeoClue2";
const MANAGER_PATH: &str = "/org/freedesktop/GeoClue2/Manager";
const MANAGER_INTERFACE: &str = "org.freedesktop.GeoClue2.Manager";
const CLIENT_INTERFACE: &str = "org.freedesktop.GeoClue2.Client";
const LOCATION_INTERFACE: &str = "org.freedesktop.GeoClue2.Location";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Location provider backed by GeoClue2 on the system bus.
///
/// Each started update stream runs on its own thread, which owns the D-Bus
/// client and is torn down by closing a stop channel.
#[derive(Default)]
pub struct GeoClueProvider {
    delegate: Mutex<Option<Arc<dyn ProviderDelegate>>>,
    stop: Mutex<Option<Sender<()>>>,
}

impl fmt::Debug for GeoClueProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoClueProvider").finish()
    }
}

impl GeoClueProvider {
    /// Constructs a provider. No D-Bus traffic happens until
    /// [`LocationProvider::start_updates`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationProvider for GeoClueProvider {
    fn set_delegate(&self, delegate: Arc<dyn ProviderDelegate>) {
        *self.delegate.lock().expect("delegate mutex poisoned") = Some(delegate);
    }

    fn authorization_status(&self) -> AuthorizationStatus {
        AuthorizationStatus::Granted
    }

    fn request_authorization(&self) {
        let delegate = self.delegate.lock().expect("delegate mutex poisoned").clone();
        if let Some(delegate) = delegate {
            delegate.on_event(ProviderEvent::Authorization(AuthorizationStatus::Granted));
        }
    }

    fn start_updates(&self) -> FetchResult<()> {
        let delegate = self
            .delegate
            .lock()
            .expect("delegate mutex poisoned")
            .clone()
            .ok_or_else(|| FetchError::ProviderUnavailable("no delegate registered".into()))?;

        let (stop_tx, stop_rx) = async_channel::bounded(1);
        if let Some(previous) = self
            .stop
            .lock()
            .expect("stop mutex poisoned")
            .replace(stop_tx)
        {
            previous.close();
        }

        thread::Builder::new()
            .name("locfetch-geoclue".into())
            .spawn(move || {
                futures::executor::block_on(async {
                    if let Err(reason) = stream_updates(delegate.as_ref(), &stop_rx).await {
                        warn!("geoclue update stream failed: {reason}");
                        delegate.on_event(ProviderEvent::Failure(reason));
                    }
                });
            })
            .map_err(|e| {
                FetchError::ProviderUnavailable(format!("failed to spawn update thread: {e}"))
            })?;
        Ok(())
    }

    fn stop_updates(&self) {
        if let Some(stop) = self.stop.lock().expect("stop mutex poisoned").take() {
            stop.close();
        }
    }
}

/// Runs one GeoClue client session: create, start, poll for fixes until the
/// stop channel closes, then stop the client.
async fn stream_updates(delegate: &dyn ProviderDelegate, stop: &Receiver<()>) -> Result<(), String> {
    let connection = Connection::system()
        .await
        .map_err(|e| format!("D-Bus connection failed: {e}"))?;

    let reply: (OwnedObjectPath,) = connection
        .call_method(
            Some(BUS_NAME),
            MANAGER_PATH,
            Some(MANAGER_INTERFACE),
            "GetClient",
            &(),
        )
        .await
        .map_err(|e| format!("GeoClue2 not available: {e}"))?
        .body()
        .deserialize()
        .map_err(|e| format!("failed to parse GetClient reply: {e}"))?;
    let client_path = reply.0;

    // DesktopId is required before Start is allowed
    connection
        .call_method(
            Some(BUS_NAME),
            client_path.as_str(),
            Some(PROPERTIES_INTERFACE),
            "Set",
            &(CLIENT_INTERFACE, "DesktopId", Value::from("locfetch")),
        )
        .await
        .map_err(|e| format!("failed to set desktop ID: {e}"))?;

    connection
        .call_method(
            Some(BUS_NAME),
            client_path.as_str(),
            Some(CLIENT_INTERFACE),
            "Start",
            &(),
        )
        .await
        .map_err(|e| format!("failed to start GeoClue client: {e}"))?;

    let mut last_fix: Option<String> = None;
    let result = loop {
        select! {
            _ = stop.recv().fuse() => break Ok(()),
            () = Delay::new(POLL_INTERVAL).fuse() => {
                match read_fix(&connection, client_path.as_str()).await {
                    Ok(Some((path, location))) => {
                        if last_fix.as_deref() != Some(path.as_str()) {
                            debug!("geoclue fix at {path}");
                            last_fix = Some(path);
                            delegate.on_event(ProviderEvent::Update(location));
                        }
                    }
                    Ok(None) => {} // no fix yet
                    Err(reason) => break Err(reason),
                }
            }
        }
    };

    let _ = connection
        .call_method(
            Some(BUS_NAME),
            client_path.as_str(),
            Some(CLIENT_INTERFACE),
            "Stop",
            &(),
        )
        .await;
    result
}

/// Reads the client's current fix, or `None` while GeoClue has none.
async fn read_fix(
    connection: &Connection,
    client_path: &str,
) -> Result<Option<(String, Location)>, String> {
    let value = read_property(connection, client_path, CLIENT_INTERFACE, "Location").await?;
    let location_path: OwnedObjectPath = value
        .try_into()
        .map_err(|e| format!("unexpected type for Location property: {e}"))?;
    // "/" means no fix has been produced yet
    if location_path.as_str() == "/" {
        return Ok(None);
    }
    let location_path = location_path.as_str().to_owned();

    let latitude = read_f64(connection, &location_path, "Latitude").await?;
    let longitude = read_f64(connection, &location_path, "Longitude").await?;
    // GeoClue reports -G_MAXDOUBLE for an unknown altitude and 0 for an
    // unknown accuracy.
    let altitude = read_f64(connection, &location_path, "Altitude")
        .await
        .ok()
        .filter(|a| *a > -1.0e300);
    let accuracy = read_f64(connection, &location_path, "Accuracy")
        .await
        .ok()
        .filter(|a| *a > 0.0);

    Ok(Some((
        location_path,
        Location {
            latitude,
            longitude,
            altitude,
            horizontal_accuracy: accuracy,
            vertical_accuracy: None,
            timestamp: unix_time_ms(),
        },
    )))
}

async fn read_f64(connection: &Connection, path: &str, property: &str) -> Result<f64, String> {
    let value = read_property(connection, path, LOCATION_INTERFACE, property).await?;
    value
        .try_into()
        .map_err(|e| format!("unexpected type for {property}: {e}"))
}

async fn read_property(
    connection: &Connection,
    path: &str,
    interface: &str,
    property: &str,
) -> Result<OwnedValue, String> {
    connection
        .call_method(
            Some(BUS_NAME),
            path,
            Some(PROPERTIES_INTERFACE),
            "Get",
            &(interface, property),
        )
        .await
        .map_err(|e| format!("failed to get {property}: {e}"))?
        .body()
        .deserialize()
        .map_err(|e| format!("failed to parse {property}: {e}"))
}
