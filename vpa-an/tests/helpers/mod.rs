//! Shared test helpers: scripted inference backend and service wiring
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vpa_an::coordinator::{DispatchCoordinator, RetryPolicy};
use vpa_an::inference::{InferenceBackend, InferenceError, InferenceRequest};
use vpa_an::ingest::NormalizedEvent;
use vpa_an::models::{AnalysisSession, MediaKind, SessionKey, View, ViewResult};
use vpa_an::store::SessionRegistry;
use vpa_common::events::EventBus;

/// Scripted stand-in for the pose backend
///
/// Outcomes are consumed per call for each view; once a view's script is
/// exhausted (or absent) every further call succeeds with the default
/// score. Calls are counted so tests can assert at-most-once dispatch.
pub struct MockBackend {
    calls: Mutex<HashMap<View, u32>>,
    scripts: Mutex<HashMap<View, VecDeque<Result<ViewResult, InferenceError>>>>,
    delay: Duration,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// A backend that "works" for `delay` before returning, honoring
    /// cancellation during the work.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            delay,
        })
    }

    /// Queue outcomes for a view, consumed one per adapter call
    pub fn script(&self, view: View, outcomes: Vec<Result<ViewResult, InferenceError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(view)
            .or_default()
            .extend(outcomes);
    }

    pub fn calls(&self, view: View) -> u32 {
        *self.calls.lock().unwrap().get(&view).unwrap_or(&0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn infer(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<ViewResult, InferenceError> {
        *self.calls.lock().unwrap().entry(request.view).or_insert(0) += 1;

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.view)
            .and_then(VecDeque::pop_front);

        scripted.unwrap_or_else(|| Ok(ok_result(0.95)))
    }
}

/// A plausible successful view result
pub fn ok_result(score: f64) -> ViewResult {
    ViewResult {
        overall_score: score,
        metrics: BTreeMap::from([
            ("knee_angle".to_string(), score),
            ("head_tilt".to_string(), score),
        ]),
        keypoints: serde_json::json!([[0.1, 0.2, 0.9]]),
        frame_count: 15,
    }
}

/// Everything a coordinator test needs, wired like main()
pub struct TestHarness {
    pub db: sqlx::SqlitePool,
    pub registry: Arc<SessionRegistry>,
    pub coordinator: Arc<DispatchCoordinator>,
    pub backend: Arc<MockBackend>,
    pub event_bus: EventBus,
    _tmp: TempDir,
}

/// Fast retry policy for tests (10ms base, 3 attempts)
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(80),
        max_attempts: 3,
    }
}

pub async fn harness(backend: Arc<MockBackend>, retry: RetryPolicy) -> TestHarness {
    let tmp = TempDir::new().unwrap();
    let db = vpa_an::db::init_database_pool(&tmp.path().join("vpa.db"))
        .await
        .unwrap();

    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(10)));
    let event_bus = EventBus::new(64);
    let coordinator = Arc::new(DispatchCoordinator::new(
        db.clone(),
        registry.clone(),
        backend.clone(),
        event_bus.clone(),
        retry,
        "videos".to_string(),
    ));

    TestHarness {
        db,
        registry,
        coordinator,
        backend,
        event_bus,
        _tmp: tmp,
    }
}

/// A normalized multi-view upload event
pub fn multi_event(owner: &str, session: &str, view: View) -> NormalizedEvent {
    NormalizedEvent {
        owner_id: owner.to_string(),
        session_id: session.to_string(),
        model_name: "cx".to_string(),
        view,
        object_key: format!("{}/{}/cx_{}.mp4", owner, session, view),
        media_kind: MediaKind::Video,
    }
}

/// A normalized single-view upload event
pub fn single_event(owner: &str, session: &str) -> NormalizedEvent {
    NormalizedEvent {
        owner_id: owner.to_string(),
        session_id: session.to_string(),
        model_name: "cx".to_string(),
        view: View::Single,
        object_key: format!("{}/cx_{}.mp4", owner, session),
        media_kind: MediaKind::Video,
    }
}

pub fn key(owner: &str, session: &str) -> SessionKey {
    SessionKey::new(owner, session)
}

pub async fn load(db: &sqlx::SqlitePool, key: &SessionKey) -> AnalysisSession {
    vpa_an::db::sessions::load_session(db, key)
        .await
        .unwrap()
        .expect("session row missing")
}

/// Poll until the session reaches a terminal state
pub async fn wait_for_terminal(db: &sqlx::SqlitePool, key: &SessionKey) -> AnalysisSession {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(session) = vpa_an::db::sessions::load_session(db, key).await.unwrap() {
            if session.is_terminal() {
                return session;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {} never reached a terminal state",
            key
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
