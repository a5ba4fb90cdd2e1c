use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use podwatch_core::{StateTransition, TransitionDedupe};
use podwatch_lifecycle::{safe_terminate, ProcessHandle, WatcherChild};
use podwatch_stream::{KubePodStream, WatchOptions};
use podwatch_watch::{PodSpecInspector, WatchLoop, WatchLoopConfig};

/// Bounded output queue; the consumer is expected to drain promptly, the
/// bound only guards against a stalled consumer eating memory.
const QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "podwatch", version, about = "Pod watch reconciliation for scheduled workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Owning controller: spawn the watcher process and consume transitions
    Run(WatchArgs),
    /// The watcher process itself (normally spawned by `run`)
    Watch(WatchArgs),
}

#[derive(Args, Debug, Clone)]
struct WatchArgs {
    /// Label selector scoping the watch to this worker's pods, e.g. "worker=<uuid>"
    #[arg(long, env = "PODWATCH_SELECTOR")]
    selector: String,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", env = "PODWATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds bounding a single watch HTTP request
    #[arg(long, default_value_t = 60)]
    request_timeout_secs: u64,

    /// Seconds before the server closes one watch stream (values of 295
    /// and above are clamped to the server-side cap)
    #[arg(long, default_value_t = 290)]
    client_timeout_secs: u64,

    /// Seconds to sleep between stream exhaustion and reconnect
    #[arg(long, default_value_t = 30, env = "PODWATCH_RECREATION_INTERVAL")]
    watcher_recreation_interval_secs: u64,

    /// Extra watch query params (repeatable), passed through unmodified
    #[arg(long = "watch-param", value_name = "KEY=VALUE")]
    watch_params: Vec<String>,

    /// Log per-event failures with full detail
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn init_tracing() {
    let env = std::env::var("PODWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PODWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PODWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_watch_params(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for item in raw {
        let (k, v) = item
            .split_once('=')
            .with_context(|| format!("invalid watch param {item:?}; expected KEY=VALUE"))?;
        out.insert(k.to_string(), v.to_string());
    }
    Ok(out)
}

/// The watcher process: runs the reconnecting watch loop and emits every
/// transition as one JSON line on stdout, in stream order.
async fn run_watcher(args: WatchArgs) -> Result<i32> {
    // Before any watch call: drop state inherited from the controller.
    podwatch_lifecycle::invalidate_inherited_caches();
    podwatch_lifecycle::install_signal_exit()?;

    let opts = WatchOptions {
        selector: args.selector.clone(),
        namespace: args.namespace.clone(),
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        client_timeout: Duration::from_secs(args.client_timeout_secs),
        extra_params: parse_watch_params(&args.watch_params)?,
    };
    let cfg = WatchLoopConfig {
        recreate_interval: Duration::from_secs(args.watcher_recreation_interval_secs),
        verbose: args.verbose,
    };

    let (tx, mut rx) = mpsc::channel::<StateTransition>(QUEUE_CAPACITY);
    // Held for the whole run: dropping the sender reads as a termination
    // request inside the loop.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let writer = tokio::spawn(async move {
        let mut out = tokio::io::stdout();
        while let Some(t) = rx.recv().await {
            let mut line = serde_json::to_vec(&t)?;
            line.push(b'\n');
            out.write_all(&line).await?;
            out.flush().await?;
        }
        anyhow::Ok(())
    });

    let wl = WatchLoop::new(
        KubePodStream::new(opts),
        Arc::new(PodSpecInspector),
        tx,
        shutdown_rx,
        cfg,
    );
    let result = wl.run().await;
    writer.await.context("transition writer task")??;
    match result {
        Ok(()) => Ok(0),
        Err(err) => {
            error!(error = format!("{err:#}"), "pod watch failed");
            Ok(1)
        }
    }
}

/// The owning controller: spawns the watcher as its own process (a stuck
/// network read must not block this side), consumes transitions and tears
/// the watcher down with the escalating terminate procedure.
async fn run_controller(args: WatchArgs) -> Result<i32> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    let mut cmd = tokio::process::Command::new(exe);
    cmd.arg("watch").arg("--selector").arg(&args.selector);
    if let Some(ns) = &args.namespace {
        cmd.arg("--ns").arg(ns);
    }
    cmd.arg("--request-timeout-secs")
        .arg(args.request_timeout_secs.to_string());
    cmd.arg("--client-timeout-secs")
        .arg(args.client_timeout_secs.to_string());
    cmd.arg("--watcher-recreation-interval-secs")
        .arg(args.watcher_recreation_interval_secs.to_string());
    for p in &args.watch_params {
        cmd.arg("--watch-param").arg(p);
    }
    if args.verbose {
        cmd.arg("--verbose");
    }

    let (mut child, stdout) = WatcherChild::spawn(cmd)?;
    info!(pid = ?child.id(), "watcher process started");
    let mut lines = BufReader::new(stdout).lines();
    // At-least-once delivery across reconnects: replayed transitions for the
    // same (pod_id, resource_version) are dropped here.
    let mut dedupe = TransitionDedupe::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; terminating watcher");
                safe_terminate(&mut child).await?;
                return Ok(0);
            }
            line = lines.next_line() => match line.context("reading watcher output")? {
                Some(line) => {
                    let t: StateTransition = match serde_json::from_str(&line) {
                        Ok(t) => t,
                        Err(err) => {
                            warn!(error = %err, "skipping malformed transition line");
                            continue;
                        }
                    };
                    if !dedupe.accept(&t) {
                        debug!(pod = %t.pod_id, rv = %t.resource_version, "duplicate transition ignored");
                        continue;
                    }
                    info!(pod = %t.pod_id, state = ?t.state, rv = %t.resource_version, "state transition");
                }
                None => {
                    // stdout closed: the watcher is gone, one way or another
                    let status = child.wait().await?;
                    return if status.success() {
                        info!("watcher exited cleanly");
                        Ok(0)
                    } else {
                        error!(status = %status, "watcher exited with failure");
                        Ok(status.code().unwrap_or(1))
                    };
                }
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_controller(args).await,
        Commands::Watch(args) => run_watcher(args).await,
    };
    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!(error = format!("{err:#}"), "podwatch failed");
            std::process::exit(1);
        }
    }
}
