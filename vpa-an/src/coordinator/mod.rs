//! Dispatch coordination
//!
//! The orchestration core. Consumes normalized upload events, decides
//! whether a session starts or continues, and drives each view through
//! the inference adapter — always inside that session's exclusive lock,
//! so the membership check and the dispatch are one atomic step
//! (check-then-act stays in the critical section).
//!
//! Failure containment: per-view errors end in the session's status row,
//! never in the worker task processing another session.

use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::aggregate;
use crate::db;
use crate::inference::{InferenceBackend, InferenceError, InferenceRequest};
use crate::ingest::{media_kind_for_key, NormalizedEvent};
use crate::models::{AnalysisSession, SessionKey, SessionStatus, View};
use crate::store::SessionRegistry;
use vpa_common::events::{AnalysisEvent, EventBus};
use vpa_common::{Error, Result};

/// Per-view retry policy: exponential backoff with jitter
///
/// Delay for attempt n is `base_delay * 2^(n-1)`, capped at `max_delay`,
/// then jittered by ±20%. A view gets at most `max_attempts` adapter
/// calls before the session fails.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retrying after the given (1-based) attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);

        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis((raw.as_millis() as f64 * jitter) as u64)
    }
}

/// Terminal outcome of a per-view dispatch (after retries)
enum DispatchFailure {
    Cancelled,
    Fatal(String),
}

/// The orchestration core
pub struct DispatchCoordinator {
    db: SqlitePool,
    registry: Arc<SessionRegistry>,
    backend: Arc<dyn InferenceBackend>,
    event_bus: EventBus,
    retry: RetryPolicy,
    /// Bucket the storage collaborator delivers events for
    bucket: String,
}

impl DispatchCoordinator {
    pub fn new(
        db: SqlitePool,
        registry: Arc<SessionRegistry>,
        backend: Arc<dyn InferenceBackend>,
        event_bus: EventBus,
        retry: RetryPolicy,
        bucket: String,
    ) -> Self {
        Self {
            db,
            registry,
            backend,
            event_bus,
            retry,
            bucket,
        }
    }

    /// Process one normalized upload event
    ///
    /// Everything from the membership check to the final row write runs
    /// under the session lock; concurrent deliveries for the same session
    /// serialize here and duplicates become no-ops.
    pub async fn handle_event(&self, event: NormalizedEvent) -> Result<()> {
        let key = event.session_key();
        let guard = self.registry.lock(&key).await?;
        let cancel = guard.cancel_token();

        let (mut session, created) = db::sessions::get_or_create(
            &self.db,
            &key,
            &event.model_name,
            expected_views_for(event.view),
        )
        .await?;
        if created {
            tracing::info!(
                session = %key,
                model = %event.model_name,
                views = session.expected_views.len(),
                "Analysis session created"
            );
            self.event_bus.emit_lossy(AnalysisEvent::SessionCreated {
                owner_id: key.owner_id.clone(),
                session_id: key.session_id.clone(),
                model_name: event.model_name.clone(),
                expected_views: session
                    .expected_views
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                timestamp: Utc::now(),
            });
        }

        if session.is_terminal() {
            tracing::debug!(
                session = %key,
                status = %session.status,
                view = %event.view,
                "Event for terminal session ignored"
            );
            return Ok(());
        }

        if cancel.is_cancelled() {
            self.finish_cancelled(&mut session).await?;
            return Ok(());
        }

        // Duplicate delivery: the view is already recorded. Confirm object
        // identity, then drop without re-invoking inference.
        if session.received_views.contains_key(&event.view) {
            match session.uploaded_objects.get(&event.view) {
                Some(prev) if prev == &event.object_key => {
                    tracing::debug!(session = %key, view = %event.view, "Duplicate delivery ignored");
                }
                Some(prev) => {
                    tracing::warn!(
                        session = %key,
                        view = %event.view,
                        recorded = %prev,
                        delivered = %event.object_key,
                        "Duplicate delivery names a different object; keeping first result"
                    );
                }
                None => {
                    tracing::warn!(
                        session = %key,
                        view = %event.view,
                        "View recorded without upload key; duplicate ignored"
                    );
                }
            }
            return Ok(());
        }

        if !session.expected_views.contains(&event.view) {
            tracing::warn!(
                session = %key,
                view = %event.view,
                "View outside the session's expected set, dropping event"
            );
            return Ok(());
        }

        if event.model_name != session.model_name {
            tracing::warn!(
                session = %key,
                session_model = %session.model_name,
                event_model = %event.model_name,
                "Event model differs from session model; using session model"
            );
        }

        session.record_upload(event.view, &event.object_key);
        if session.status == SessionStatus::Pending {
            session.transition_to(SessionStatus::InProgress);
        }
        db::sessions::save_session(&self.db, &session).await?;

        let request = InferenceRequest {
            model_name: session.model_name.clone(),
            view: event.view,
            bucket: self.bucket.clone(),
            object_key: event.object_key.clone(),
            media_kind: event.media_kind,
        };

        let outcome = self.dispatch_with_retries(&key, &request, &cancel).await;

        // Cancellation observed immediately after the adapter returns wins
        // over a successful result.
        match outcome {
            Ok(_) if cancel.is_cancelled() => {
                self.finish_cancelled(&mut session).await?;
            }
            Ok(result) => {
                session.record_view(event.view, result);
                db::sessions::save_session(&self.db, &session).await?;
                self.event_bus.emit_lossy(AnalysisEvent::ViewCompleted {
                    owner_id: key.owner_id.clone(),
                    session_id: key.session_id.clone(),
                    view: event.view.to_string(),
                    progress: session.progress,
                    timestamp: Utc::now(),
                });

                tracing::info!(
                    session = %key,
                    view = %event.view,
                    progress = session.progress,
                    "View inference recorded"
                );

                if session.all_views_received() {
                    self.finish_completed(&mut session).await?;
                }
            }
            Err(DispatchFailure::Cancelled) => {
                self.finish_cancelled(&mut session).await?;
            }
            Err(DispatchFailure::Fatal(error)) => {
                self.finish_failed(&mut session, error).await?;
            }
        }

        Ok(())
    }

    /// Cancellation hook for the deletion collaborator
    ///
    /// Signals the token before taking the lock so an in-flight adapter
    /// call abandons promptly, then records the terminal state under the
    /// lock. Returns the session's status after cancellation.
    pub async fn cancel(&self, key: &SessionKey) -> Result<SessionStatus> {
        self.registry.signal_cancel(key);

        let _guard = self.registry.lock(key).await?;
        let mut session = match db::sessions::load_session(&self.db, key).await? {
            Some(session) => session,
            None => {
                // Nothing to cancel; don't poison a future session with a
                // pre-cancelled token.
                self.registry.reset_cancel_token(key);
                return Err(Error::NotFound(format!("analysis session {}", key)));
            }
        };

        if matches!(
            session.status,
            SessionStatus::Pending | SessionStatus::InProgress
        ) {
            self.finish_cancelled(&mut session).await?;
        }

        Ok(session.status)
    }

    /// External re-attempt action: reset a failed session and re-dispatch
    /// every recorded upload. Returns the number of views re-dispatched.
    pub async fn reset_and_redispatch(self: Arc<Self>, key: &SessionKey) -> Result<usize> {
        let (model_name, uploads) = {
            let _guard = self.registry.lock(key).await?;
            let mut session = db::sessions::load_session(&self.db, key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("analysis session {}", key)))?;

            if session.status != SessionStatus::Failed {
                return Err(Error::InvalidInput(format!(
                    "session {} is {}; only failed sessions can be retried",
                    key, session.status
                )));
            }

            self.registry.reset_cancel_token(key);
            session.reset_for_retry();
            db::sessions::save_session(&self.db, &session).await?;

            tracing::info!(session = %key, "Failed session reset to pending for re-dispatch");
            (session.model_name.clone(), session.uploaded_objects.clone())
        };

        let mut dispatched = 0;
        for (view, object_key) in uploads {
            let media_kind = match media_kind_for_key(&object_key) {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::warn!(
                        session = %key,
                        view = %view,
                        error = %e,
                        "Recorded upload no longer parseable, skipping re-dispatch"
                    );
                    continue;
                }
            };

            let event = NormalizedEvent {
                owner_id: key.owner_id.clone(),
                session_id: key.session_id.clone(),
                model_name: model_name.clone(),
                view,
                object_key,
                media_kind,
            };

            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = coordinator.handle_event(event).await {
                    tracing::error!(error = %e, "Re-dispatch worker failed");
                }
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// One view through the adapter, with bounded backoff retries
    ///
    /// The backoff sleep races the cancellation token, so a cancel during
    /// the wait wins before the next attempt fires.
    async fn dispatch_with_retries(
        &self,
        key: &SessionKey,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<crate::models::ViewResult, DispatchFailure> {
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(DispatchFailure::Cancelled);
            }

            let error = match self.backend.infer(request, cancel).await {
                Ok(result) => return Ok(result),
                Err(InferenceError::Cancelled) => return Err(DispatchFailure::Cancelled),
                Err(error) => error,
            };

            if !error.is_retryable() {
                tracing::warn!(
                    session = %key,
                    view = %request.view,
                    error = %error,
                    "Fatal inference failure, no retry"
                );
                return Err(DispatchFailure::Fatal(error.to_string()));
            }

            if attempt >= self.retry.max_attempts {
                tracing::warn!(
                    session = %key,
                    view = %request.view,
                    attempts = attempt,
                    error = %error,
                    "Inference retries exhausted"
                );
                return Err(DispatchFailure::Fatal(format!(
                    "view {} failed after {} attempts: {}",
                    request.view, attempt, error
                )));
            }

            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                session = %key,
                view = %request.view,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable inference failure, backing off"
            );
            self.event_bus.emit_lossy(AnalysisEvent::ViewRetrying {
                owner_id: key.owner_id.clone(),
                session_id: key.session_id.clone(),
                view: request.view.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
                timestamp: Utc::now(),
            });

            tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchFailure::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    async fn finish_completed(&self, session: &mut AnalysisSession) -> Result<()> {
        let combined = aggregate::aggregate(&session.model_name, &session.received_views);
        session.combined_result = Some(combined);
        session.transition_to(SessionStatus::Completed);
        db::sessions::save_session(&self.db, session).await?;

        tracing::info!(session = %session.key(), "Analysis session completed");
        self.event_bus.emit_lossy(AnalysisEvent::SessionCompleted {
            owner_id: session.owner_id.clone(),
            session_id: session.session_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn finish_failed(&self, session: &mut AnalysisSession, error: String) -> Result<()> {
        session.error = Some(error.clone());
        session.transition_to(SessionStatus::Failed);
        db::sessions::save_session(&self.db, session).await?;

        tracing::warn!(session = %session.key(), error = %error, "Analysis session failed");
        self.event_bus.emit_lossy(AnalysisEvent::SessionFailed {
            owner_id: session.owner_id.clone(),
            session_id: session.session_id.clone(),
            error,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn finish_cancelled(&self, session: &mut AnalysisSession) -> Result<()> {
        session.transition_to(SessionStatus::Cancelled);
        db::sessions::save_session(&self.db, session).await?;

        tracing::info!(session = %session.key(), "Analysis session cancelled");
        self.event_bus.emit_lossy(AnalysisEvent::SessionCancelled {
            owner_id: session.owner_id.clone(),
            session_id: session.session_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// Expected view set declared at session creation
///
/// Single-view keys declare `{single}`. Multi-view sessions target the
/// full four-view set; the fan-in completes when all four arrive.
fn expected_views_for(view: View) -> BTreeSet<View> {
    if view == View::Single {
        std::iter::once(View::Single).collect()
    } else {
        View::MULTI.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        };

        for attempt in 1..=4u32 {
            let nominal = 100u64 * 2u64.pow(attempt - 1);
            let delay = policy.delay_for(attempt).as_millis() as u64;
            assert!(
                delay >= nominal * 8 / 10 && delay <= nominal * 12 / 10,
                "attempt {}: delay {} outside ±20% of {}",
                attempt,
                delay,
                nominal
            );
        }
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: 10,
        };

        let delay = policy.delay_for(8).as_millis() as u64;
        // 400ms cap, +20% jitter at most
        assert!(delay <= 480, "delay {} exceeds jittered cap", delay);
    }

    #[test]
    fn single_view_expects_singleton_set() {
        let set = expected_views_for(View::Single);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&View::Single));
    }

    #[test]
    fn multi_view_expects_all_four() {
        let set = expected_views_for(View::Left);
        assert_eq!(set.len(), 4);
        assert!(!set.contains(&View::Single));
    }
}
