//! Podwatch core types: wire events, cursors and state transitions.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Orchestrator error code meaning the resumption token is too old to honor.
pub const CURSOR_EXPIRED_CODE: i32 = 410;

/// Opaque resumption token for a pod watch stream.
///
/// The sentinel value (`"0"` or empty) means "start from latest"; the watch
/// request omits the token entirely in that case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCursor(String);

impl WatchCursor {
    pub const SENTINEL: &'static str = "0";

    pub fn sentinel() -> Self {
        Self(Self::SENTINEL.to_string())
    }

    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0.is_empty() || self.0 == Self::SENTINEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WatchCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pod lifecycle phase as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

// Hand-rolled so unrecognized phase strings map to Unknown instead of
// failing the whole event.
impl<'de> Deserialize<'de> for PodPhase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateWaiting {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    #[serde(default)]
    pub waiting: Option<ContainerStateWaiting>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(default)]
    pub init_container_statuses: Vec<ContainerStatus>,
}

/// One revision of a watched pod, as carried by a watch event.
///
/// Only the slices of the object this subsystem consumes are modeled; the
/// rest of the pod manifest is dropped at deserialization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub metadata: PodMeta,
    #[serde(default)]
    pub status: PodStatus,
}

impl PodSnapshot {
    pub fn pod_id(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn phase(&self) -> PodPhase {
        self.status.phase
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    pub fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }
}

/// Error status embedded in an `ERROR` watch event when the stream cannot
/// continue (cursor too old, server-side failures).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorPayload {
    pub fn is_cursor_expired(&self) -> bool {
        self.code == CURSOR_EXPIRED_CODE
    }
}

/// Raw watch event in the orchestrator's line format
/// `{"type": "...", "object": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "object")]
pub enum RawEvent {
    #[serde(rename = "ADDED")]
    Added(PodSnapshot),
    #[serde(rename = "MODIFIED")]
    Modified(PodSnapshot),
    #[serde(rename = "DELETED")]
    Deleted(PodSnapshot),
    /// Server-issued progress marker; carries no pod state.
    #[serde(rename = "BOOKMARK")]
    Bookmark(serde_json::Value),
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
}

impl RawEvent {
    pub fn pod(&self) -> Option<&PodSnapshot> {
        match self {
            RawEvent::Added(p) | RawEvent::Modified(p) | RawEvent::Deleted(p) => Some(p),
            RawEvent::Bookmark(_) | RawEvent::Error(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, RawEvent::Deleted(_))
    }
}

/// Semantic worker state derived from pod lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Running,
    Failed,
    UpForReschedule,
}

/// Unit published downstream to the owning scheduler. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub pod_id: String,
    pub state: WorkerState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub resource_version: String,
}

impl StateTransition {
    pub fn from_pod(pod: &PodSnapshot, state: WorkerState) -> Self {
        Self {
            pod_id: pod.pod_id().to_string(),
            state,
            labels: pod.labels().clone(),
            resource_version: pod.resource_version().to_string(),
        }
    }
}

/// Unrecoverable stream failure surfaced out-of-band to the owner.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("pod watch stream failed for {reason} with code {code}: {message}")]
pub struct FatalStreamError {
    pub code: i32,
    pub reason: String,
    pub message: String,
}

impl From<&ErrorPayload> for FatalStreamError {
    fn from(p: &ErrorPayload) -> Self {
        Self { code: p.code, reason: p.reason.clone(), message: p.message.clone() }
    }
}

/// Consumer-side guard making at-least-once delivery idempotent: a replayed
/// `(pod_id, resource_version)` pair is reported as already seen.
///
/// Revisions arrive in non-decreasing order per pod, so only the latest one
/// is kept; memory stays bounded by the number of live pods.
#[derive(Debug, Default)]
pub struct TransitionDedupe {
    latest: HashMap<String, String>,
}

impl TransitionDedupe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the transition is new and should be applied.
    pub fn accept(&mut self, t: &StateTransition) -> bool {
        match self.latest.get(&t.pod_id) {
            Some(rv) if *rv == t.resource_version => false,
            _ => {
                self.latest
                    .insert(t.pod_id.clone(), t.resource_version.clone());
                true
            }
        }
    }

    /// Number of pods currently tracked.
    pub fn tracked_pods(&self) -> usize {
        self.latest.len()
    }
}

pub mod prelude {
    pub use super::{
        ErrorPayload, FatalStreamError, PodPhase, PodSnapshot, RawEvent, StateTransition,
        WatchCursor, WorkerState,
    };
}
