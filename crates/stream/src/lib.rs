//! Podwatch kube integration: the watch stream client.
//!
//! Wraps the orchestrator's pod watch API behind [`PodStream`] so the watch
//! loop can be driven by scripted streams in tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::WatchParams;
use kube::core::WatchEvent;
use kube::{Client, Config};
use tracing::{debug, info};

use podwatch_core::{ErrorPayload, PodSnapshot, RawEvent, WatchCursor};

/// One watch attempt: a lazy sequence of raw events. Ends without error when
/// the server closes the stream after the per-stream timeout.
pub type EventStream = BoxStream<'static, Result<RawEvent>>;

#[async_trait]
pub trait PodStream: Send + Sync {
    async fn open(&self, cursor: &WatchCursor) -> Result<EventStream>;
}

/// Parameters scoping a pod watch.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Label selector resolving to the logical worker, e.g. `worker=<uuid>`.
    pub selector: String,
    /// Namespace to watch; all namespaces when unset.
    pub namespace: Option<String>,
    /// Bound on a single HTTP request.
    pub request_timeout: Duration,
    /// Bound on total stream duration before the server closes it.
    pub client_timeout: Duration,
    /// Pass-through query params, not interpreted here.
    pub extra_params: BTreeMap<String, String>,
}

/// Kube-backed [`PodStream`].
pub struct KubePodStream {
    opts: WatchOptions,
}

impl KubePodStream {
    pub fn new(opts: WatchOptions) -> Self {
        Self { opts }
    }
}

/// The server rejects per-stream timeouts of 295s and above; longer
/// configured bounds are clamped to this.
const MAX_STREAM_TIMEOUT_SECS: u64 = 294;

#[async_trait]
impl PodStream for KubePodStream {
    async fn open(&self, cursor: &WatchCursor) -> Result<EventStream> {
        let client = cached_client(self.opts.request_timeout).await?;
        let req = build_watch_request(&self.opts, cursor)?;

        let events = client
            .request_events::<PodSnapshot>(req)
            .await
            .context("opening pod watch stream")?;
        info!(
            selector = %self.opts.selector,
            ns = ?self.opts.namespace,
            cursor = %cursor,
            "pod watch stream opened"
        );
        let events = events
            .map(|ev| ev.map_err(anyhow::Error::from))
            .try_filter_map(|ev| futures::future::ready(Ok(from_watch_event(ev))))
            .boxed();
        Ok(events)
    }
}

fn build_watch_request(
    opts: &WatchOptions,
    cursor: &WatchCursor,
) -> Result<http::Request<Vec<u8>>> {
    let wp = WatchParams::default()
        .labels(&opts.selector)
        .timeout(opts.client_timeout.as_secs().min(MAX_STREAM_TIMEOUT_SECS) as u32);
    let path = match opts.namespace.as_deref() {
        Some(ns) => format!("/api/v1/namespaces/{ns}/pods"),
        None => "/api/v1/pods".to_string(),
    };
    let req = kube::core::Request::new(path)
        .watch(&wp, cursor.as_str())
        .context("building pod watch request")?;
    // The sentinel cursor means "start from latest": the token is omitted
    // from the request rather than sent as "0".
    finalize_request(req, cursor.is_sentinel(), &opts.extra_params)
}

fn from_watch_event(ev: WatchEvent<PodSnapshot>) -> Option<RawEvent> {
    match ev {
        WatchEvent::Added(p) => Some(RawEvent::Added(p)),
        WatchEvent::Modified(p) => Some(RawEvent::Modified(p)),
        WatchEvent::Deleted(p) => Some(RawEvent::Deleted(p)),
        WatchEvent::Bookmark(_) => {
            debug!("skipping watch bookmark");
            None
        }
        WatchEvent::Error(e) => Some(RawEvent::Error(ErrorPayload {
            code: i32::from(e.code),
            reason: e.reason,
            message: e.message,
        })),
    }
}

static CLIENT_CACHE: Mutex<Option<Client>> = Mutex::new(None);

/// Drop the cached client and any credential state it holds. The next watch
/// call re-infers its configuration from the current environment.
pub fn reset_client_cache() {
    if let Ok(mut guard) = CLIENT_CACHE.lock() {
        *guard = None;
    }
}

async fn cached_client(request_timeout: Duration) -> Result<Client> {
    if let Some(client) = CLIENT_CACHE.lock().ok().and_then(|g| g.clone()) {
        return Ok(client);
    }
    let mut config = Config::infer().await.context("inferring kube client config")?;
    config.connect_timeout = Some(request_timeout);
    config.read_timeout = Some(request_timeout);
    let client = Client::try_from(config).context("building kube client")?;
    if let Ok(mut guard) = CLIENT_CACHE.lock() {
        *guard = Some(client.clone());
    }
    Ok(client)
}

fn finalize_request(
    req: http::Request<Vec<u8>>,
    drop_resource_version: bool,
    extra: &BTreeMap<String, String>,
) -> Result<http::Request<Vec<u8>>> {
    if !drop_resource_version && extra.is_empty() {
        return Ok(req);
    }
    let (mut parts, body) = req.into_parts();
    let query = rebuild_query(parts.uri.query().unwrap_or(""), drop_resource_version, extra);
    let uri = if query.is_empty() {
        parts.uri.path().to_string()
    } else {
        format!("{}?{}", parts.uri.path(), query)
    };
    parts.uri = uri.parse::<http::Uri>().context("rebuilding watch request uri")?;
    Ok(http::Request::from_parts(parts, body))
}

fn rebuild_query(
    query: &str,
    drop_resource_version: bool,
    extra: &BTreeMap<String, String>,
) -> String {
    let mut pairs: Vec<String> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .filter(|p| !(drop_resource_version && p.starts_with("resourceVersion=")))
        .map(str::to_string)
        .collect();
    for (k, v) in extra {
        pairs.push(format!("{k}={v}"));
    }
    pairs.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(client_timeout: Duration) -> WatchOptions {
        WatchOptions {
            selector: "worker=w1".to_string(),
            namespace: Some("jobs".to_string()),
            request_timeout: Duration::from_secs(60),
            client_timeout,
            extra_params: BTreeMap::new(),
        }
    }

    #[test]
    fn long_stream_timeout_is_clamped_below_server_cap() {
        let req = build_watch_request(&opts(Duration::from_secs(300)), &WatchCursor::new("42"))
            .expect("request must build with an oversized timeout");
        let q = req.uri().query().unwrap().to_string();
        assert!(q.contains("timeoutSeconds=294"), "query: {q}");
        assert!(q.contains("resourceVersion=42"), "query: {q}");
    }

    #[test]
    fn sentinel_cursor_builds_request_without_resource_version() {
        let req = build_watch_request(&opts(Duration::from_secs(60)), &WatchCursor::sentinel()).unwrap();
        let q = req.uri().query().unwrap();
        assert!(!q.contains("resourceVersion="), "query: {q}");
        assert!(q.contains("timeoutSeconds=60"), "query: {q}");
    }

    #[test]
    fn pod_watch_events_map_to_raw_events() {
        let pod: PodSnapshot = serde_json::from_value(json!({
            "metadata": {"name": "p1", "resourceVersion": "3"},
            "status": {"phase": "Running"}
        }))
        .unwrap();
        match from_watch_event(WatchEvent::Modified(pod)) {
            Some(RawEvent::Modified(p)) => assert_eq!(p.pod_id(), "p1"),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn error_status_lines_carry_code_reason_message() {
        let ev: WatchEvent<PodSnapshot> = serde_json::from_value(json!({
            "type": "ERROR",
            "object": {
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "code": 410,
                "reason": "Expired",
                "message": "too old resource version"
            }
        }))
        .unwrap();
        match from_watch_event(ev) {
            Some(RawEvent::Error(p)) => {
                assert!(p.is_cursor_expired());
                assert_eq!(p.reason, "Expired");
                assert_eq!(p.message, "too old resource version");
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn bookmark_lines_are_dropped() {
        let ev: WatchEvent<PodSnapshot> = serde_json::from_value(json!({
            "type": "BOOKMARK",
            "object": {"kind": "Pod", "apiVersion": "v1", "metadata": {"resourceVersion": "12"}}
        }))
        .unwrap();
        assert!(from_watch_event(ev).is_none());
    }

    #[test]
    fn sentinel_cursor_is_omitted_from_query() {
        let q = rebuild_query(
            "labelSelector=worker%3Dw1&resourceVersion=0&timeoutSeconds=300",
            true,
            &BTreeMap::new(),
        );
        assert_eq!(q, "labelSelector=worker%3Dw1&timeoutSeconds=300");
    }

    #[test]
    fn real_cursor_is_kept() {
        let q = rebuild_query("watch=true&resourceVersion=123", false, &BTreeMap::new());
        assert_eq!(q, "watch=true&resourceVersion=123");
    }

    #[test]
    fn extra_params_pass_through_unmodified() {
        let extra = BTreeMap::from([
            ("fieldSelector".to_string(), "status.phase=Pending".to_string()),
            ("pretty".to_string(), "false".to_string()),
        ]);
        let q = rebuild_query("watch=true", false, &extra);
        assert_eq!(q, "watch=true&fieldSelector=status.phase=Pending&pretty=false");
    }
}
