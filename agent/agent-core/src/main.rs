//! CANFLUX Edge Agent
//!
//! Entry point. Responsibilities:
//! 1. Load configuration
//! 2. Open the blob store for schemas and undelivered payloads
//! 3. Start the policy manager (schema ingress → runtime artifacts)
//! 4. Start one CAN data source per configured interface
//! 5. Start the OBD worker (ECU discovery + PID/DTC polling)
//! 6. Start the trigger engine (sample store, condition evaluation)
//! 7. Start the uplink (sender worker + checkin emitter)
//!
//! Data topology inside the agent:
//!
//!   [cloud receiver] → [SchemaInbox] → [Policy manager] ─┬→ dictionaries → CAN/OBD sources
//!                                                        ├→ inspection matrix → trigger engine
//!                                                        └→ checkin documents → checkin sender
//!
//!   [CAN sources] ──┐
//!                   ├─→ [Signal buffer] → [Trigger engine] → [payload queue] → [Sender worker]
//!   [OBD worker]  ──┘

mod config;
mod sink;

use std::sync::Arc;

use anyhow::{Context, Result};
use inspection_engine::{CustomFunctionRegistry, TriggerEngine};
use policy_manager::{InterfaceTranslator, PolicyManager};
use signal_core::SystemClock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uplink::{CheckinSender, FileBlobStore, SenderWorker};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = config::AgentConfig::load().map_err(|e| {
        eprintln!("FATAL: {e}");
        e
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                cfg.log_level
                    .parse()
                    .unwrap_or_else(|_| "info".parse().expect("literal filter"))
            }),
        )
        .json()
        .init();

    info!(
        vehicle_id = %cfg.vehicle_id,
        version = env!("CARGO_PKG_VERSION"),
        "canflux edge agent starting"
    );

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(cfg.metrics.bind_addr.parse::<std::net::SocketAddr>()?)
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("metrics exporter: {e}"))?;

    let clock = SystemClock::new();
    let store = Arc::new(
        FileBlobStore::new(&cfg.persistency_path).with_context(|| {
            format!("opening blob store at {}", cfg.persistency_path.display())
        })?,
    );

    // ── Shutdown + fatal signalling ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<can_adapter::BusError>(4);

    // ── Policy manager ──────────────────────────────────────────────────────
    let translator = InterfaceTranslator::new(
        cfg.can_interfaces
            .iter()
            .map(|i| (i.interface_id.clone(), i.source.channel_id)),
    );
    // The schema inbox is the attachment point for the connectivity
    // collaborator's receive side.
    let (policy_manager, _schema_inbox, outputs) = PolicyManager::new(
        clock.clone(),
        Arc::clone(&store) as Arc<dyn uplink::BlobStore>,
        translator,
        cfg.idle_time_ms,
        shutdown_rx.clone(),
    );
    let policy_task = tokio::spawn(policy_manager.run());

    // ── Acquisition ─────────────────────────────────────────────────────────
    let (signal_tx, signal_rx) = signal_core::signal_buffer(cfg.signal_buffer_size);

    for interface in &cfg.can_interfaces {
        let source = can_adapter::CanDataSource::new(
            interface.source.clone(),
            clock.clone(),
            signal_tx.clone(),
            outputs.dictionaries.clone(),
            shutdown_rx.clone(),
            fatal_tx.clone(),
        );
        info!(
            interface = %interface.source.interface_name,
            channel_id = interface.source.channel_id,
            "starting CAN data source"
        );
        tokio::spawn(source.run());
    }

    let mut obd_handle = None;
    if let Some(obd_cfg) = cfg.obd.clone() {
        if obd_cfg.is_enabled() {
            let module = obd_adapter::ObdOverCanModule::new(
                obd_cfg,
                clock.clone(),
                signal_tx.clone(),
                outputs.dictionaries.clone(),
                outputs.inspection.clone(),
                shutdown_rx.clone(),
                fatal_tx.clone(),
            );
            obd_handle = Some(tokio::task::spawn_blocking(move || module.run()));
        } else {
            info!("OBD polling disabled by configuration");
        }
    }

    // ── Inspection ──────────────────────────────────────────────────────────
    let (payload_tx, payload_rx) = mpsc::channel(cfg.payload_queue_size);
    let (fetch_req_tx, mut fetch_req_rx) = mpsc::channel::<inspection_engine::FetchRequest>(64);
    let registry = Arc::new(CustomFunctionRegistry::default());

    let engine = TriggerEngine::new(
        clock.clone(),
        signal_rx,
        outputs.inspection.clone(),
        outputs.fetch.clone(),
        payload_tx,
        fetch_req_tx,
        registry,
        shutdown_rx.clone(),
    );
    let engine_task = tokio::spawn(engine.run());

    // Fetch requests target custom data sources; none are compiled into
    // this build, so requests are surfaced for diagnosis and dropped.
    tokio::spawn(async move {
        while let Some(request) = fetch_req_rx.recv().await {
            debug!(
                scheme_id = %request.scheme_id,
                signal_id = request.signal_id,
                actions = request.actions.len(),
                "fetch request has no registered consumer"
            );
        }
    });

    // ── Uplink ──────────────────────────────────────────────────────────────
    let cloud_sink: Arc<dyn uplink::CloudSink> = Arc::new(sink::LogOnlySink::default());
    let sender = SenderWorker::new(
        clock.clone(),
        Arc::clone(&cloud_sink),
        Arc::clone(&store) as Arc<dyn uplink::BlobStore>,
        payload_rx,
        cfg.persistency_upload_retry_interval_ms,
        shutdown_rx.clone(),
    );
    let sender_task = tokio::spawn(sender.run());

    let checkin = CheckinSender::new(
        clock.clone(),
        cloud_sink,
        outputs.checkin_documents.clone(),
        cfg.checkin_interval_ms,
        shutdown_rx.clone(),
    );
    let checkin_task = tokio::spawn(checkin.run());

    // ── Run until a fatal bus error, task exit or SIGINT ────────────────────
    tokio::select! {
        Some(fatal) = fatal_rx.recv() => {
            error!(error = %fatal, "fatal bus condition, shutting down");
        }
        result = policy_task => {
            error!("policy manager exited unexpectedly: {result:?}");
        }
        result = engine_task => {
            error!("trigger engine exited unexpectedly: {result:?}");
        }
        result = sender_task => {
            error!("sender worker exited unexpectedly: {result:?}");
        }
        result = checkin_task => {
            error!("checkin sender exited unexpectedly: {result:?}");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down gracefully");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = obd_handle {
        if let Err(e) = handle.await {
            warn!("OBD worker join error: {e}");
        }
    }
    info!("canflux edge agent stopped");
    Ok(())
}
