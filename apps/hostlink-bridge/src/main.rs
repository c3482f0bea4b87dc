#![cfg_attr(test, allow(clippy::expect_used))]

mod demo_handler;
mod host;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hostlink_control_client::{ControlPlaneClient, ControlPlaneClientConfig};
use hostlink_dispatch::{
    CommandQueue, DesignatedThread, DispatchConfig, DispatchPump, HandlerGeneration,
    PollingTransport, RecoveryCoordinator, RecoverySignal, TransportConfig,
};
use tracing::{info, warn};

use crate::demo_handler::DemoModule;
use crate::host::FixedRateHost;

#[derive(Parser, Debug)]
#[command(
    name = "hostlink-bridge",
    about = "Bridge a hostlink control plane to a simulated main-thread host"
)]
struct Args {
    /// Control plane base URL. Overrides HOSTLINK_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,
    /// Client id to register with. Overrides HOSTLINK_CLIENT_ID.
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long)]
    display_name: Option<String>,
    /// Per-command wait bound in milliseconds.
    #[arg(long)]
    command_timeout_ms: Option<u64>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Commands executed per host tick.
    #[arg(long)]
    max_batch: Option<usize>,
    /// Host tick period in milliseconds.
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,
    /// Exit after this many seconds instead of waiting for a signal.
    #[arg(long)]
    run_for_secs: Option<u64>,
    /// Simulate a code reload by bumping the handler generation periodically.
    #[arg(long)]
    reload_every_secs: Option<u64>,
}

impl Args {
    fn apply_dispatch(&self, mut config: DispatchConfig) -> DispatchConfig {
        if let Some(max_batch) = self.max_batch {
            config.max_batch = max_batch.max(1);
        }
        config
    }

    fn apply_transport(&self, mut config: TransportConfig) -> TransportConfig {
        if let Some(base_url) = self.base_url.as_ref() {
            config.base_url.clone_from(base_url);
        }
        if let Some(client_id) = self.client_id.as_ref() {
            config.client_id.clone_from(client_id);
        }
        if let Some(display_name) = self.display_name.as_ref() {
            config.display_name.clone_from(display_name);
        }
        if let Some(millis) = self.command_timeout_ms {
            config.command_timeout = Duration::from_millis(millis.max(1));
        }
        if let Some(millis) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(millis.max(1));
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let dispatch_config =
        args.apply_dispatch(DispatchConfig::from_env().context("read dispatch config")?);
    let transport_config =
        args.apply_transport(TransportConfig::from_env().context("read transport config")?);

    let main_thread = Arc::new(DesignatedThread::new());
    main_thread.bind_current();

    let queue = CommandQueue::new(dispatch_config.clone(), main_thread.clone());
    let signal = RecoverySignal::new(dispatch_config.affinity_violation_threshold);
    let generation = HandlerGeneration::new();
    let coordinator = Arc::new(RecoveryCoordinator::new(
        Arc::clone(&queue),
        Arc::clone(&signal),
        generation.clone(),
        Box::new(DemoModule::new()),
    ));
    coordinator
        .initialize()
        .context("build initial demo handler")?;

    let client = ControlPlaneClient::new(ControlPlaneClientConfig {
        base_url: transport_config.base_url.clone(),
        timeout_ms: transport_config.request_timeout.as_millis() as u64,
        request_attempts: 1,
    })
    .context("build control plane client")?;
    let transport = Arc::new(PollingTransport::new(
        Arc::new(client),
        Arc::clone(&queue),
        signal,
        transport_config,
    ));
    coordinator.attach_transport(transport.clone());

    if !transport.connect() {
        warn!("initial registration failed; retrying in the background");
        transport.resume();
    }

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .with_context(|| format!("register handler for signal {signal}"))?;
    }

    let reloader = args
        .reload_every_secs
        .map(|secs| spawn_reloader(generation, Duration::from_secs(secs.max(1)), Arc::clone(&stop)))
        .transpose()
        .context("spawn reload simulator")?;

    let mut pump = DispatchPump::new(Arc::clone(&coordinator));
    let interval = Duration::from_millis(args.tick_ms.max(1)).max(pump.tick_interval());
    let mut host = FixedRateHost::new(
        interval,
        Arc::clone(&stop),
        args.run_for_secs.map(Duration::from_secs),
    );
    info!(
        tick_ms = interval.as_millis(),
        max_batch = dispatch_config.max_batch,
        "host loop running"
    );
    pump.run_on(&mut host);

    stop.store(true, Ordering::SeqCst);
    let cleared = queue.clear_all("bridge shutting down");
    transport.shutdown();
    if let Some(reloader) = reloader
        && reloader.join().is_err()
    {
        warn!("reload simulator panicked");
    }
    main_thread.unbind();

    let pump_stats = pump.stats();
    let queue_stats = queue.stats();
    info!(
        ticks = host.ticks(),
        drained = pump_stats.drained,
        executed = queue_stats.executed,
        timeouts = queue_stats.timeouts,
        restarts = coordinator.restarts_completed(),
        restart_failures = coordinator.restarts_failed(),
        dropped_commands = cleared.dropped_commands,
        cancelled_waits = cleared.cancelled_waits,
        "bridge stopped"
    );
    Ok(())
}

fn spawn_reloader(
    generation: HandlerGeneration,
    every: Duration,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("hostlink-reload".to_string())
        .spawn(move || {
            let slice = Duration::from_millis(50);
            let mut waited = Duration::ZERO;
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(slice);
                waited += slice;
                if waited >= every {
                    waited = Duration::ZERO;
                    let current = generation.bump();
                    info!(generation = current, "simulated handler code change");
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;
    use hostlink_dispatch::{DispatchConfig, TransportConfig};

    use super::Args;

    #[test]
    fn flags_override_env_config() {
        let args = Args::try_parse_from([
            "hostlink-bridge",
            "--base-url",
            "http://plane.local:9000",
            "--client-id",
            "studio-1",
            "--command-timeout-ms",
            "2500",
            "--max-batch",
            "0",
        ])
        .expect("parse args");

        let dispatch = args.apply_dispatch(DispatchConfig::default());
        assert_eq!(dispatch.max_batch, 1);

        let transport = args.apply_transport(TransportConfig::default());
        assert_eq!(transport.base_url, "http://plane.local:9000");
        assert_eq!(transport.client_id, "studio-1");
        assert_eq!(transport.command_timeout, Duration::from_millis(2500));
        assert_eq!(transport.poll_interval, TransportConfig::default().poll_interval);
    }

    #[test]
    fn defaults_leave_config_untouched() {
        let args = Args::try_parse_from(["hostlink-bridge"]).expect("parse args");
        assert_eq!(args.tick_ms, 16);
        let base = TransportConfig {
            client_id: "fixed".to_string(),
            ..TransportConfig::default()
        };
        assert_eq!(args.apply_transport(base.clone()), base);
    }
}
