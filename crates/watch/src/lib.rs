//! Podwatch reconciliation: classifies raw pod events into worker state
//! transitions and drives the reconnecting watch loop.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use podwatch_core::{
    FatalStreamError, PodPhase, PodSnapshot, RawEvent, StateTransition, WatchCursor, WorkerState,
};
use podwatch_stream::{EventStream, PodStream};

// ---- deploy-error inspection ----

/// Why a pod stuck in `Pending` will never start.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeployError {
    #[error("container {container} cannot start ({reason}): {message}")]
    Container {
        container: String,
        reason: String,
        message: String,
    },
    #[error("pod is unschedulable: {0}")]
    Unschedulable(String),
}

/// Decides whether a `Pending` pod has failed to deploy.
pub trait DeployInspector: Send + Sync {
    fn inspect(&self, pod: &PodSnapshot) -> Result<(), DeployError>;
}

/// Waiting reasons that mean the container will never come up on its own.
const DEPLOY_ERROR_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// Default inspector: looks at container waiting states and the
/// `PodScheduled` condition of the snapshot itself.
#[derive(Debug, Default)]
pub struct PodSpecInspector;

impl DeployInspector for PodSpecInspector {
    fn inspect(&self, pod: &PodSnapshot) -> Result<(), DeployError> {
        let statuses = pod
            .status
            .init_container_statuses
            .iter()
            .chain(pod.status.container_statuses.iter());
        for cs in statuses {
            if let Some(waiting) = &cs.state.waiting {
                if let Some(reason) = waiting.reason.as_deref() {
                    if DEPLOY_ERROR_REASONS.contains(&reason) {
                        return Err(DeployError::Container {
                            container: cs.name.clone(),
                            reason: reason.to_string(),
                            message: waiting.message.clone().unwrap_or_default(),
                        });
                    }
                }
            }
        }
        for cond in &pod.status.conditions {
            if cond.kind == "PodScheduled"
                && cond.status == "False"
                && cond.reason.as_deref() == Some("Unschedulable")
            {
                return Err(DeployError::Unschedulable(
                    cond.message.clone().unwrap_or_default(),
                ));
            }
        }
        Ok(())
    }
}

// ---- event classification ----

/// Outcome of classifying one raw event.
#[derive(Debug)]
pub enum Verdict {
    /// Pod event handled: optional transition plus the revision the cursor
    /// advances to once the transition is published.
    Event {
        transition: Option<StateTransition>,
        resource_version: String,
    },
    /// Progress marker, nothing to publish or advance.
    Skip,
    /// Cursor expired on the server; reconnect from latest.
    ResetCursor,
    /// Unrecoverable stream error; the loop must stop.
    Fatal(FatalStreamError),
}

pub fn classify(event: &RawEvent, inspector: &dyn DeployInspector) -> Verdict {
    let pod = match event {
        RawEvent::Error(payload) => {
            return if payload.is_cursor_expired() {
                // Expected condition: the server dropped our token. Not an
                // error, the loop restarts from latest.
                info!(message = %payload.message, "watch cursor too old; resetting to latest");
                Verdict::ResetCursor
            } else {
                Verdict::Fatal(FatalStreamError::from(payload))
            };
        }
        RawEvent::Bookmark(_) => return Verdict::Skip,
        RawEvent::Added(p) | RawEvent::Modified(p) | RawEvent::Deleted(p) => p,
    };

    let transition = match pod.phase() {
        PodPhase::Pending if event.is_deleted() => {
            // Orchestrator removed the pod before it started (preemption).
            info!(pod = %pod.pod_id(), "pod deleted while pending; marking for reschedule");
            Some(StateTransition::from_pod(pod, WorkerState::UpForReschedule))
        }
        PodPhase::Pending => match inspector.inspect(pod) {
            Err(err) => {
                info!(pod = %pod.pod_id(), error = %err, "pod failed to deploy");
                Some(StateTransition::from_pod(pod, WorkerState::Failed))
            }
            Ok(()) => None,
        },
        PodPhase::Running => Some(StateTransition::from_pod(pod, WorkerState::Running)),
        // Terminal outcomes are owned by the scheduler's status poller, not
        // this watcher; the cursor still advances past them.
        PodPhase::Succeeded | PodPhase::Failed | PodPhase::Unknown => None,
    };
    Verdict::Event {
        transition,
        resource_version: pod.resource_version().to_string(),
    }
}

// ---- resumption tracking ----

/// Sole owner of the watch cursor. Advanced only after the corresponding
/// event was fully handled, read only at reconnect time.
#[derive(Debug)]
pub struct ResumptionTracker {
    cursor: WatchCursor,
}

impl ResumptionTracker {
    pub fn new(initial: WatchCursor) -> Self {
        Self { cursor: initial }
    }

    pub fn current(&self) -> &WatchCursor {
        &self.cursor
    }

    pub fn advance(&mut self, resource_version: String) {
        self.cursor = WatchCursor::new(resource_version);
    }

    pub fn reset(&mut self) {
        self.cursor = WatchCursor::sentinel();
    }
}

// ---- watch loop ----

#[derive(Debug, Clone)]
pub struct WatchLoopConfig {
    /// Sleep between normal stream exhaustion and the next connect.
    pub recreate_interval: Duration,
    /// Log per-event failures with full detail instead of a warning.
    pub verbose: bool,
}

impl Default for WatchLoopConfig {
    fn default() -> Self {
        Self {
            recreate_interval: Duration::from_secs(30),
            verbose: false,
        }
    }
}

enum Drained {
    End,
    ResetCursor,
    Terminated,
}

/// Reconnecting driver: pulls events from a [`PodStream`], classifies them
/// and publishes transitions in stream order to a bounded channel.
pub struct WatchLoop<S> {
    stream: S,
    inspector: Arc<dyn DeployInspector>,
    tracker: ResumptionTracker,
    out: mpsc::Sender<StateTransition>,
    shutdown: watch::Receiver<bool>,
    cfg: WatchLoopConfig,
}

impl<S: PodStream> WatchLoop<S> {
    pub fn new(
        stream: S,
        inspector: Arc<dyn DeployInspector>,
        out: mpsc::Sender<StateTransition>,
        shutdown: watch::Receiver<bool>,
        cfg: WatchLoopConfig,
    ) -> Self {
        Self {
            stream,
            inspector,
            tracker: ResumptionTracker::new(WatchCursor::sentinel()),
            out,
            shutdown,
            cfg,
        }
    }

    /// Run until termination is requested (`Ok`) or the stream fails in an
    /// unrecoverable way (`Err`, downcastable to [`FatalStreamError`] when
    /// the server reported a structured failure).
    pub async fn run(mut self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                info!("termination requested; watch loop exiting");
                return Ok(());
            }
            let cursor = self.tracker.current().clone();
            info!(cursor = %cursor, "connecting pod watch");
            let mut stream = self
                .stream
                .open(&cursor)
                .await
                .context("connecting pod watch stream")?;
            match self.drain(&mut stream).await? {
                Drained::End => {
                    counter!("podwatch_reconnects_total", 1);
                    info!(
                        cursor = %self.tracker.current(),
                        secs = self.cfg.recreate_interval.as_secs(),
                        "pod watch stream ended; reconnecting after delay"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.recreate_interval) => {}
                        _ = self.shutdown.changed() => return Ok(()),
                    }
                }
                Drained::ResetCursor => {
                    // immediate reconnect from latest, no delay
                    counter!("podwatch_cursor_resets_total", 1);
                    self.tracker.reset();
                }
                Drained::Terminated => return Ok(()),
            }
        }
    }

    async fn drain(&mut self, stream: &mut EventStream) -> Result<Drained> {
        use futures::StreamExt;
        loop {
            let item = tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("termination requested; stopping event stream");
                    return Ok(Drained::Terminated);
                }
                item = stream.next() => item,
            };
            let Some(item) = item else {
                return Ok(Drained::End);
            };
            let event = match item {
                Ok(ev) => ev,
                Err(err) => {
                    // One bad event must never abort the whole stream.
                    self.event_error(&err);
                    continue;
                }
            };
            if let Some(pod) = event.pod() {
                debug!(pod = %pod.pod_id(), phase = ?pod.phase(), "pod event");
            }
            match classify(&event, self.inspector.as_ref()) {
                Verdict::Event {
                    transition,
                    resource_version,
                } => {
                    if let Some(t) = transition {
                        counter!("podwatch_transitions_total", 1);
                        if self.out.send(t).await.is_err() {
                            warn!("transition consumer dropped; stopping watch loop");
                            return Ok(Drained::Terminated);
                        }
                    }
                    // Advance only after publication: a reconnect may then
                    // re-deliver an event, but never skip an unpublished one.
                    self.tracker.advance(resource_version);
                }
                Verdict::Skip => {}
                Verdict::ResetCursor => return Ok(Drained::ResetCursor),
                Verdict::Fatal(err) => return Err(err.into()),
            }
        }
    }

    fn event_error(&self, err: &anyhow::Error) {
        counter!("podwatch_event_errors_total", 1);
        if self.cfg.verbose {
            error!(error = ?err, "failed to process watch event; continuing");
        } else {
            warn!(error = %err, "failed to process watch event; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podwatch_core::ErrorPayload;

    fn pod(name: &str, phase: &str, rv: &str) -> PodSnapshot {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": name,
                "namespace": "jobs",
                "labels": {"worker": "w-1"},
                "resourceVersion": rv
            },
            "status": {"phase": phase}
        }))
        .unwrap()
    }

    fn pod_with_status(name: &str, rv: &str, status: serde_json::Value) -> PodSnapshot {
        serde_json::from_value(serde_json::json!({
            "metadata": {"name": name, "resourceVersion": rv},
            "status": status
        }))
        .unwrap()
    }

    fn expect_transition(v: Verdict) -> (StateTransition, String) {
        match v {
            Verdict::Event {
                transition: Some(t),
                resource_version,
            } => (t, resource_version),
            other => panic!("expected a transition, got {other:?}"),
        }
    }

    #[test]
    fn deleted_pending_pod_reschedules_not_fails() {
        let ev = RawEvent::Deleted(pod("p1", "Pending", "5"));
        let (t, rv) = expect_transition(classify(&ev, &PodSpecInspector));
        assert_eq!(t.state, WorkerState::UpForReschedule);
        assert_eq!(t.pod_id, "p1");
        assert_eq!(rv, "5");
    }

    #[test]
    fn pending_pod_with_image_pull_error_fails() {
        let p = pod_with_status(
            "p2",
            "6",
            serde_json::json!({
                "phase": "Pending",
                "containerStatuses": [{
                    "name": "main",
                    "state": {"waiting": {"reason": "ImagePullBackOff", "message": "no such image"}}
                }]
            }),
        );
        let (t, _) = expect_transition(classify(&RawEvent::Modified(p), &PodSpecInspector));
        assert_eq!(t.state, WorkerState::Failed);
    }

    #[test]
    fn clean_pending_pod_emits_nothing_but_advances_cursor() {
        let ev = RawEvent::Added(pod("p3", "Pending", "7"));
        match classify(&ev, &PodSpecInspector) {
            Verdict::Event {
                transition: None,
                resource_version,
            } => assert_eq!(resource_version, "7"),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn running_pod_emits_running() {
        let ev = RawEvent::Modified(pod("p4", "Running", "8"));
        let (t, _) = expect_transition(classify(&ev, &PodSpecInspector));
        assert_eq!(t.state, WorkerState::Running);
        assert_eq!(t.labels.get("worker").map(String::as_str), Some("w-1"));
    }

    #[test]
    fn terminal_phases_are_noops() {
        for phase in ["Succeeded", "Failed", "Unknown"] {
            let ev = RawEvent::Modified(pod("p5", phase, "9"));
            match classify(&ev, &PodSpecInspector) {
                Verdict::Event {
                    transition: None,
                    resource_version,
                } => assert_eq!(resource_version, "9"),
                other => panic!("phase {phase}: unexpected verdict {other:?}"),
            }
        }
    }

    #[test]
    fn gone_error_resets_cursor() {
        let ev = RawEvent::Error(ErrorPayload {
            code: 410,
            reason: "Expired".into(),
            message: "too old resource version".into(),
        });
        assert!(matches!(classify(&ev, &PodSpecInspector), Verdict::ResetCursor));
    }

    #[test]
    fn other_stream_error_is_fatal_with_details() {
        let ev = RawEvent::Error(ErrorPayload {
            code: 500,
            reason: "Internal".into(),
            message: "x".into(),
        });
        match classify(&ev, &PodSpecInspector) {
            Verdict::Fatal(err) => {
                assert_eq!(err.code, 500);
                assert_eq!(err.reason, "Internal");
                assert_eq!(err.message, "x");
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn inspector_flags_unschedulable_pod() {
        let p = pod_with_status(
            "p6",
            "10",
            serde_json::json!({
                "phase": "Pending",
                "conditions": [{
                    "type": "PodScheduled",
                    "status": "False",
                    "reason": "Unschedulable",
                    "message": "0/3 nodes available"
                }]
            }),
        );
        let err = PodSpecInspector.inspect(&p).unwrap_err();
        assert!(matches!(err, DeployError::Unschedulable(_)));
    }

    #[test]
    fn inspector_ignores_benign_waiting_reasons() {
        let p = pod_with_status(
            "p7",
            "11",
            serde_json::json!({
                "phase": "Pending",
                "containerStatuses": [{
                    "name": "main",
                    "state": {"waiting": {"reason": "ContainerCreating"}}
                }]
            }),
        );
        assert!(PodSpecInspector.inspect(&p).is_ok());
    }

    #[test]
    fn tracker_advances_and_resets() {
        let mut tracker = ResumptionTracker::new(WatchCursor::sentinel());
        assert!(tracker.current().is_sentinel());
        tracker.advance("41".into());
        tracker.advance("42".into());
        assert_eq!(tracker.current().as_str(), "42");
        tracker.reset();
        assert!(tracker.current().is_sentinel());
    }
}
