//! Domain model for analysis sessions
//!
//! A session groups 1-4 camera views of one posture recording. Sessions
//! move through a small state machine:
//! PENDING → IN_PROGRESS → {COMPLETED, FAILED}; CANCELLED is reachable
//! from PENDING and IN_PROGRESS. Terminal states never transition again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Camera view of one uploaded media object
///
/// Ordering is the fixed aggregation order (front, left, right, back),
/// with `Single` sorting last for one-file sessions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Front,
    Left,
    Right,
    Back,
    Single,
}

impl View {
    /// The four multi-view camera angles, in aggregation order
    pub const MULTI: [View; 4] = [View::Front, View::Left, View::Right, View::Back];

    pub fn as_str(&self) -> &'static str {
        match self {
            View::Front => "front",
            View::Left => "left",
            View::Right => "right",
            View::Back => "back",
            View::Single => "single",
        }
    }

    /// Title-cased name for feedback text ("Front", "Single", ...)
    pub fn title(&self) -> &'static str {
        match self {
            View::Front => "Front",
            View::Left => "Left",
            View::Right => "Right",
            View::Back => "Back",
            View::Single => "Single",
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for View {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(View::Front),
            "left" => Ok(View::Left),
            "right" => Ok(View::Right),
            "back" => Ok(View::Back),
            "single" => Ok(View::Single),
            _ => Err(()),
        }
    }
}

/// Media class of an uploaded object, decided by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
}

/// Per-view inference output recorded into the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewResult {
    /// Derived overall posture score (0.0-1.0)
    pub overall_score: f64,
    /// Per-metric scores (knee_angle, head_tilt, ...)
    pub metrics: BTreeMap<String, f64>,
    /// Raw per-frame keypoints as returned by the backend
    #[serde(default)]
    pub keypoints: serde_json::Value,
    /// Number of sampled frames the backend scored
    pub frame_count: u32,
}

/// Combined document produced once all expected views completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub model_name: String,
    /// View name -> per-view result, in fixed view order
    pub views: BTreeMap<View, ViewResult>,
    /// Human-readable summary derived from per-view scores
    pub feedback: String,
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(()),
        }
    }
}

/// Key addressing one session: unique per owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub owner_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(owner_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.session_id)
    }
}

/// One analysis session: the unit of orchestration
///
/// Mutated only by the dispatch coordinator and the cancellation hook,
/// always under the per-session lock. The persisted row is the source of
/// truth; this struct is its in-memory image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSession {
    pub owner_id: String,
    pub session_id: String,
    pub model_name: String,
    /// View set declared at session creation; fan-in target
    pub expected_views: BTreeSet<View>,
    /// View -> result, present once that view's inference completed.
    /// Grows monotonically; cleared only by the explicit reset operation.
    pub received_views: BTreeMap<View, ViewResult>,
    /// View -> object key of the first upload event seen for that view
    pub uploaded_objects: BTreeMap<View, String>,
    pub status: SessionStatus,
    /// 0-100; non-decreasing while in progress; exactly 100 iff completed
    pub progress: u8,
    pub combined_result: Option<CombinedResult>,
    /// Terminal failure description, if any
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisSession {
    pub fn new(key: &SessionKey, model_name: &str, expected_views: BTreeSet<View>) -> Self {
        let now = Utc::now();
        Self {
            owner_id: key.owner_id.clone(),
            session_id: key.session_id.clone(),
            model_name: model_name.to_string(),
            expected_views,
            received_views: BTreeMap::new(),
            uploaded_objects: BTreeMap::new(),
            status: SessionStatus::Pending,
            progress: 0,
            combined_result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.owner_id.clone(), self.session_id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to a new status, stamping `updated_at`
    ///
    /// Completion snaps progress to exactly 100.
    pub fn transition_to(&mut self, status: SessionStatus) {
        tracing::debug!(
            session = %self.key(),
            old = %self.status,
            new = %status,
            "Session state transition"
        );
        self.status = status;
        if status == SessionStatus::Completed {
            self.progress = 100;
        }
        self.updated_at = Utc::now();
    }

    /// Record the object key of the first upload seen for a view.
    /// Returns false (and keeps the original) if one was already recorded.
    pub fn record_upload(&mut self, view: View, object_key: &str) -> bool {
        if self.uploaded_objects.contains_key(&view) {
            return false;
        }
        self.uploaded_objects.insert(view, object_key.to_string());
        self.updated_at = Utc::now();
        true
    }

    /// Record a completed view result and recompute progress
    pub fn record_view(&mut self, view: View, result: ViewResult) {
        self.received_views.insert(view, result);
        self.progress = self.computed_progress();
        self.updated_at = Utc::now();
    }

    /// `floor(100 * |received| / |expected|)`, generalized to any view
    /// cardinality. The final snap to 100 happens in `transition_to`.
    pub fn computed_progress(&self) -> u8 {
        if self.expected_views.is_empty() {
            return 0;
        }
        ((100 * self.received_views.len()) / self.expected_views.len()) as u8
    }

    /// Fan-in check: every expected view has a recorded result
    pub fn all_views_received(&self) -> bool {
        self.expected_views
            .iter()
            .all(|v| self.received_views.contains_key(v))
    }

    /// Explicit reset: a failed session back to pending for re-dispatch.
    /// The one operation allowed to shrink `received_views`.
    pub fn reset_for_retry(&mut self) {
        self.received_views.clear();
        self.combined_result = None;
        self.error = None;
        self.progress = 0;
        self.transition_to(SessionStatus::Pending);
    }
}
