//! The fetch coordinator: one cycle state machine owning the provider.
//!
//! All pending-request mutation happens on a dedicated cycle thread fed by
//! two channels (fetch commands, provider events), so a request can never be
//! lost or double-delivered by a caller racing a resolving cycle.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::thread;

use async_channel::{Receiver, Sender, unbounded};
use futures::future::Fuse;
use futures::{FutureExt, StreamExt, select};
use futures_timer::Delay;
use log::{debug, warn};

use crate::provider::{AuthorizationStatus, LocationProvider, ProviderDelegate, ProviderEvent};
use crate::{FetchConfig, FetchError, FetchResult, Location, sys, unix_time_ms};

type Outcome = FetchResult<Location>;

/// A pending request: resolved exactly once with the cycle outcome.
enum Waiter {
    Channel(Sender<Outcome>),
    Callback(Box<dyn FnOnce(Outcome) + Send>),
}

impl Waiter {
    fn resolve(self, outcome: Outcome) {
        match self {
            // The caller may have dropped its future; nothing to deliver to.
            Self::Channel(tx) => drop(tx.try_send(outcome)),
            Self::Callback(completion) => completion(outcome),
        }
    }
}

struct FetchCommand {
    waiter: Waiter,
}

/// Forwards provider events into the cycle thread.
struct ChannelDelegate {
    sender: Sender<ProviderEvent>,
}

impl ProviderDelegate for ChannelDelegate {
    fn on_event(&self, event: ProviderEvent) {
        if let Err(err) = self.sender.try_send(event) {
            warn!("dropping provider event: {err}");
        }
    }
}

/// Process-wide coordinator for one-shot location fetches.
///
/// At most one provider cycle is active at any time; callers arriving while
/// a cycle runs join its pending set and receive the same outcome
/// (single-flight coalescing). Failures are terminal for the cycle, never
/// for the coordinator, which returns to idle ready for the next call.
pub struct LocationFetcher {
    commands: Sender<FetchCommand>,
    config: FetchConfig,
    // Keeps the event channel open even if a provider drops its delegate.
    _events: Sender<ProviderEvent>,
}

impl fmt::Debug for LocationFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationFetcher")
            .field("config", &self.config)
            .finish()
    }
}

static SHARED: OnceLock<LocationFetcher> = OnceLock::new();

impl LocationFetcher {
    /// Returns the process-wide coordinator, creating it on first call.
    ///
    /// Creation allocates channels and spawns the idle cycle thread; the
    /// provider's update stream is not touched until a fetch is issued.
    /// Safe to call repeatedly and concurrently.
    pub fn shared() -> &'static Self {
        SHARED.get_or_init(|| Self::with_provider(sys::default_provider(), FetchConfig::default()))
    }

    /// Builds a coordinator over a custom provider and policy.
    ///
    /// This is the seam tests and embedders use to substitute the platform
    /// provider.
    #[must_use]
    pub fn with_provider(provider: Arc<dyn LocationProvider>, config: FetchConfig) -> Self {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        provider.set_delegate(Arc::new(ChannelDelegate {
            sender: event_tx.clone(),
        }));

        spawn_cycle_loop(provider, config.clone(), command_rx, event_rx);

        Self {
            commands: command_tx,
            config,
            _events: event_tx,
        }
    }

    /// The policy in effect for this coordinator.
    #[must_use]
    pub const fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Resolves with the device's current location.
    ///
    /// Joins the active cycle if one is running, otherwise starts one.
    /// Concurrent callers all resolve with the same outcome. The first fix
    /// after process start can take several seconds.
    ///
    /// # Errors
    /// Returns the [`FetchError`] that resolved the cycle: authorization
    /// denial or restriction, a provider failure, or a timeout.
    pub async fn fetch_current_location(&self) -> FetchResult<Location> {
        let (tx, rx) = async_channel::bounded(1);
        if self
            .commands
            .try_send(FetchCommand {
                waiter: Waiter::Channel(tx),
            })
            .is_err()
        {
            return Err(cycle_gone());
        }
        rx.recv().await.unwrap_or_else(|_| Err(cycle_gone()))
    }

    /// Completion-callback form of [`Self::fetch_current_location`].
    ///
    /// `completion` is invoked exactly once, on an internal thread, with
    /// either the fix or the failure that resolved the cycle. Callers must
    /// not assume it runs on the thread that issued the fetch.
    pub fn fetch_current_location_with<F>(&self, completion: F)
    where
        F: FnOnce(FetchResult<Location>) + Send + 'static,
    {
        let command = FetchCommand {
            waiter: Waiter::Callback(Box::new(completion)),
        };
        if let Err(err) = self.commands.try_send(command) {
            // Unreachable while the cycle thread lives; still exactly-once.
            err.into_inner().waiter.resolve(Err(cycle_gone()));
        }
    }
}

fn cycle_gone() -> FetchError {
    FetchError::ProviderUnavailable("fetch cycle thread terminated".into())
}

fn spawn_cycle_loop(
    provider: Arc<dyn LocationProvider>,
    config: FetchConfig,
    commands: Receiver<FetchCommand>,
    events: Receiver<ProviderEvent>,
) {
    thread::Builder::new()
        .name("locfetch-cycle".into())
        .spawn(move || futures::executor::block_on(cycle_loop(&provider, &config, commands, events)))
        .expect("failed to spawn fetch cycle thread");
}

/// The single-flight cycle state machine.
///
/// Idle until a fetch command arrives, then: resolve authorization, start
/// the update stream, wait for a usable fix or a failure, stop the stream,
/// fan the one outcome out to every waiter collected along the way.
async fn cycle_loop(
    provider: &Arc<dyn LocationProvider>,
    config: &FetchConfig,
    commands: Receiver<FetchCommand>,
    events: Receiver<ProviderEvent>,
) {
    // `async_channel::Receiver` is `!Unpin`, but `select!` over it requires
    // an `Unpin` stream; pin behind a box so the select sites type-check.
    let mut commands = Box::pin(commands);
    let mut events = Box::pin(events);
    while let Ok(first) = commands.recv().await {
        let mut waiters = vec![first.waiter];
        while let Ok(command) = commands.try_recv() {
            waiters.push(command.waiter);
        }
        // Events left over from the previous cycle are history, not
        // answers; a fix that arrived after a timeout must not leak into
        // the next cycle.
        while events.try_recv().is_ok() {}

        let outcome =
            run_cycle(provider.as_ref(), config, &mut commands, &mut events, &mut waiters).await;
        match &outcome {
            Ok(fix) => debug!(
                "cycle resolved with fix {:.5},{:.5} for {} waiter(s)",
                fix.latitude,
                fix.longitude,
                waiters.len()
            ),
            Err(err) => warn!("cycle failed for {} waiter(s): {err}", waiters.len()),
        }
        for waiter in waiters {
            waiter.resolve(outcome.clone());
        }
    }
}

async fn run_cycle(
    provider: &dyn LocationProvider,
    config: &FetchConfig,
    commands: &mut Pin<Box<Receiver<FetchCommand>>>,
    events: &mut Pin<Box<Receiver<ProviderEvent>>>,
    waiters: &mut Vec<Waiter>,
) -> Outcome {
    // One deadline covers both the authorization wait and the fix wait.
    let mut deadline = Delay::new(config.timeout).fuse();

    let mut status = provider.authorization_status();
    if status == AuthorizationStatus::NotDetermined {
        debug!("requesting location authorization");
        provider.request_authorization();
        status = loop {
            select! {
                command = commands.select_next_some() => waiters.push(command.waiter),
                event = events.select_next_some() => match event {
                    ProviderEvent::Authorization(answer)
                        if answer != AuthorizationStatus::NotDetermined =>
                    {
                        break answer;
                    }
                    ProviderEvent::Failure(reason) => {
                        return Err(FetchError::ProviderUnavailable(reason));
                    }
                    _ => {}
                },
                () = deadline => return Err(FetchError::Timeout),
            }
        };
    }

    match status {
        AuthorizationStatus::Denied => return Err(FetchError::AuthorizationDenied),
        AuthorizationStatus::Restricted => return Err(FetchError::AuthorizationRestricted),
        AuthorizationStatus::Granted | AuthorizationStatus::NotDetermined => {}
    }

    provider.start_updates()?;
    let outcome = await_fix(config, commands, events, waiters, &mut deadline).await;
    provider.stop_updates();
    outcome
}

async fn await_fix(
    config: &FetchConfig,
    commands: &mut Pin<Box<Receiver<FetchCommand>>>,
    events: &mut Pin<Box<Receiver<ProviderEvent>>>,
    waiters: &mut Vec<Waiter>,
    mut deadline: &mut Fuse<Delay>,
) -> Outcome {
    loop {
        select! {
            command = commands.select_next_some() => waiters.push(command.waiter),
            event = events.select_next_some() => match event {
                ProviderEvent::Update(fix) => {
                    if acceptable(config, &fix) {
                        return Ok(fix);
                    }
                    debug!(
                        "discarding fix below quality bar (accuracy {:?}, age {}ms)",
                        fix.horizontal_accuracy,
                        unix_time_ms().saturating_sub(fix.timestamp)
                    );
                }
                ProviderEvent::Failure(reason) => {
                    return Err(FetchError::ProviderUnavailable(reason));
                }
                ProviderEvent::Authorization(AuthorizationStatus::Denied) => {
                    return Err(FetchError::AuthorizationDenied);
                }
                ProviderEvent::Authorization(AuthorizationStatus::Restricted) => {
                    return Err(FetchError::AuthorizationRestricted);
                }
                ProviderEvent::Authorization(_) => {}
            },
            () = deadline => return Err(FetchError::Timeout),
        }
    }
}

/// Whether a fix clears the configured recency and accuracy bars.
fn acceptable(config: &FetchConfig, fix: &Location) -> bool {
    if let Some(accuracy) = fix.horizontal_accuracy {
        if accuracy > config.accuracy_threshold {
            return false;
        }
    }
    u128::from(unix_time_ms().saturating_sub(fix.timestamp)) <= config.maximum_fix_age.as_millis()
}
