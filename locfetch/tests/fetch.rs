//! Coordinator behavior against a scripted provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use locfetch::provider::{AuthorizationStatus, LocationProvider, ProviderDelegate, ProviderEvent};
use locfetch::{FetchConfig, FetchError, FetchResult, Location, LocationFetcher};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn fix(latitude: f64, longitude: f64, accuracy: f64) -> Location {
    Location {
        latitude,
        longitude,
        altitude: Some(11.0),
        horizontal_accuracy: Some(accuracy),
        vertical_accuracy: None,
        timestamp: now_ms(),
    }
}

fn quick_config(timeout_ms: u64) -> FetchConfig {
    FetchConfig {
        timeout: Duration::from_millis(timeout_ms),
        ..FetchConfig::default()
    }
}

/// A provider that replays a scripted event sequence when started.
///
/// Script entries are (delay, event) pairs; delays apply between entries.
#[derive(Default)]
struct MockProvider {
    authorization: Mutex<AuthorizationStatus>,
    authorization_answer: Mutex<Option<AuthorizationStatus>>,
    fail_start: Mutex<Option<FetchError>>,
    script: Mutex<Vec<(Duration, ProviderEvent)>>,
    delegate: Mutex<Option<Arc<dyn ProviderDelegate>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    requests: AtomicUsize,
}

impl MockProvider {
    fn granted() -> Self {
        Self {
            authorization: Mutex::new(AuthorizationStatus::Granted),
            ..Self::default()
        }
    }

    fn with_status(status: AuthorizationStatus) -> Self {
        Self {
            authorization: Mutex::new(status),
            ..Self::default()
        }
    }

    fn undetermined(answer: AuthorizationStatus) -> Self {
        Self {
            authorization_answer: Mutex::new(Some(answer)),
            ..Self::default()
        }
    }

    fn failing_start(reason: &str) -> Self {
        Self {
            authorization: Mutex::new(AuthorizationStatus::Granted),
            fail_start: Mutex::new(Some(FetchError::ProviderUnavailable(reason.into()))),
            ..Self::default()
        }
    }

    fn queue(&self, delay: Duration, event: ProviderEvent) {
        self.script.lock().unwrap().push((delay, event));
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl LocationProvider for MockProvider {
    fn set_delegate(&self, delegate: Arc<dyn ProviderDelegate>) {
        *self.delegate.lock().unwrap() = Some(delegate);
    }

    fn authorization_status(&self) -> AuthorizationStatus {
        *self.authorization.lock().unwrap()
    }

    fn request_authorization(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let answer = self.authorization_answer.lock().unwrap().take();
        let delegate = self.delegate.lock().unwrap().clone();
        if let (Some(answer), Some(delegate)) = (answer, delegate) {
            *self.authorization.lock().unwrap() = answer;
            delegate.on_event(ProviderEvent::Authorization(answer));
        }
    }

    fn start_updates(&self) -> FetchResult<()> {
        if let Some(err) = self.fail_start.lock().unwrap().take() {
            return Err(err);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let script: Vec<_> = self.script.lock().unwrap().drain(..).collect();
        if let Some(delegate) = self.delegate.lock().unwrap().clone() {
            thread::spawn(move || {
                for (delay, event) in script {
                    thread::sleep(delay);
                    delegate.on_event(event);
                }
            });
        }
        Ok(())
    }

    fn stop_updates(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn coalesced_fetches_share_one_cycle() {
    let provider = Arc::new(MockProvider::granted());
    provider.queue(
        Duration::from_millis(80),
        ProviderEvent::Update(fix(51.5, -0.12, 10.0)),
    );
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(2_000));

    let (a, b, c, d) = tokio::join!(
        fetcher.fetch_current_location(),
        fetcher.fetch_current_location(),
        fetcher.fetch_current_location(),
        fetcher.fetch_current_location(),
    );

    let first = a.expect("fix");
    assert!((first.latitude - 51.5).abs() < f64::EPSILON);
    assert!((first.longitude + 0.12).abs() < f64::EPSILON);
    assert_eq!(first.horizontal_accuracy, Some(10.0));
    for result in [b, c, d] {
        assert_eq!(result.expect("fix"), first);
    }
    assert_eq!(provider.starts(), 1);
    assert_eq!(provider.stops(), 1);
}

#[test]
fn shared_instance_is_singleton() {
    let first = LocationFetcher::shared();
    let from_thread = thread::spawn(LocationFetcher::shared).join().expect("join");
    assert!(std::ptr::eq(first, from_thread));
}

#[tokio::test]
async fn denied_authorization_fails_without_starting_provider() {
    let provider = Arc::new(MockProvider::with_status(AuthorizationStatus::Denied));
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(1_000));

    let err = fetcher.fetch_current_location().await.expect_err("denied");
    assert_eq!(err, FetchError::AuthorizationDenied);
    assert_eq!(provider.starts(), 0);
    assert_eq!(provider.stops(), 0);
}

#[tokio::test]
async fn restricted_authorization_maps_to_restricted() {
    let provider = Arc::new(MockProvider::with_status(AuthorizationStatus::Restricted));
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(1_000));

    let err = fetcher.fetch_current_location().await.expect_err("restricted");
    assert_eq!(err, FetchError::AuthorizationRestricted);
    assert_eq!(provider.starts(), 0);
}

#[tokio::test]
async fn authorization_request_answered_with_denial() {
    let provider = Arc::new(MockProvider::undetermined(AuthorizationStatus::Denied));
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(1_000));

    let err = fetcher.fetch_current_location().await.expect_err("denied");
    assert_eq!(err, FetchError::AuthorizationDenied);
    assert_eq!(provider.requests(), 1);
    assert_eq!(provider.starts(), 0);
}

#[tokio::test]
async fn authorization_granted_then_fix_resolves() {
    let provider = Arc::new(MockProvider::undetermined(AuthorizationStatus::Granted));
    provider.queue(
        Duration::from_millis(30),
        ProviderEvent::Update(fix(48.85, 2.35, 25.0)),
    );
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(2_000));

    let location = fetcher.fetch_current_location().await.expect("fix");
    assert!((location.latitude - 48.85).abs() < f64::EPSILON);
    assert_eq!(provider.requests(), 1);
    assert_eq!(provider.starts(), 1);
    assert_eq!(provider.stops(), 1);
}

#[tokio::test]
async fn timeout_without_fix_stops_provider() {
    let provider = Arc::new(MockProvider::granted());
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(150));

    let err = fetcher.fetch_current_location().await.expect_err("timeout");
    assert_eq!(err, FetchError::Timeout);
    assert_eq!(provider.starts(), 1);
    assert_eq!(provider.stops(), 1);
}

#[test]
fn late_update_after_timeout_is_not_delivered() {
    let provider = Arc::new(MockProvider::granted());
    provider.queue(
        Duration::from_millis(400),
        ProviderEvent::Update(fix(51.5, -0.12, 10.0)),
    );
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(100));

    let (tx, rx) = mpsc::channel();
    fetcher.fetch_current_location_with(move |outcome| tx.send(outcome).expect("send"));

    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("completion");
    assert_eq!(outcome, Err(FetchError::Timeout));

    // The fix arrives well after the cycle resolved; nothing further may
    // reach the completion.
    thread::sleep(Duration::from_millis(500));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn coarse_fix_rejected_until_sharp_one_arrives() {
    let provider = Arc::new(MockProvider::granted());
    provider.queue(
        Duration::from_millis(30),
        ProviderEvent::Update(fix(51.5, -0.12, 500.0)),
    );
    provider.queue(
        Duration::from_millis(60),
        ProviderEvent::Update(fix(51.5, -0.12, 10.0)),
    );
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(2_000));

    let location = fetcher.fetch_current_location().await.expect("fix");
    assert_eq!(location.horizontal_accuracy, Some(10.0));
}

#[tokio::test]
async fn stale_fix_is_not_a_current_location() {
    let provider = Arc::new(MockProvider::granted());
    let mut cached = fix(51.5, -0.12, 10.0);
    cached.timestamp = now_ms() - 10 * 60 * 1_000;
    provider.queue(Duration::from_millis(30), ProviderEvent::Update(cached));
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(300));

    let err = fetcher.fetch_current_location().await.expect_err("stale only");
    assert_eq!(err, FetchError::Timeout);
}

#[tokio::test]
async fn provider_failure_resolves_with_unavailable() {
    let provider = Arc::new(MockProvider::granted());
    provider.queue(
        Duration::from_millis(30),
        ProviderEvent::Failure("gps hardware offline".into()),
    );
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(2_000));

    let err = fetcher.fetch_current_location().await.expect_err("failure");
    match err {
        FetchError::ProviderUnavailable(reason) => assert_eq!(reason, "gps hardware offline"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.stops(), 1);
}

#[tokio::test]
async fn start_failure_surfaces_without_stop() {
    let provider = Arc::new(MockProvider::failing_start("geoclue not running"));
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(1_000));

    let err = fetcher.fetch_current_location().await.expect_err("start failed");
    match err {
        FetchError::ProviderUnavailable(reason) => assert_eq!(reason, "geoclue not running"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.starts(), 0);
    assert_eq!(provider.stops(), 0);
}

#[tokio::test]
async fn coordinator_is_reusable_after_failure() {
    let provider = Arc::new(MockProvider::granted());
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(120));

    let err = fetcher.fetch_current_location().await.expect_err("timeout");
    assert_eq!(err, FetchError::Timeout);

    provider.queue(
        Duration::from_millis(30),
        ProviderEvent::Update(fix(35.68, 139.69, 15.0)),
    );
    let location = fetcher.fetch_current_location().await.expect("fix");
    assert!((location.longitude - 139.69).abs() < f64::EPSILON);
    assert_eq!(provider.starts(), 2);
    assert_eq!(provider.stops(), 2);
}

#[test]
fn callback_form_delivers_success_exactly_once() {
    let provider = Arc::new(MockProvider::granted());
    provider.queue(
        Duration::from_millis(30),
        ProviderEvent::Update(fix(51.5, -0.12, 10.0)),
    );
    let fetcher = LocationFetcher::with_provider(provider.clone(), quick_config(2_000));

    let (tx, rx) = mpsc::channel();
    fetcher.fetch_current_location_with(move |outcome| tx.send(outcome).expect("send"));

    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("completion");
    let location = outcome.expect("fix");
    assert!((location.latitude - 51.5).abs() < f64::EPSILON);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}
