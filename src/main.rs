//! Position Scanner
//!
//! Periodically scans lending protocols for liquidatable positions and ranks
//! them with best-execution swap quotes.
//! - Settings from `SCANNER_CONFIG` (TOML) or the `SCANNER_PROFILE` preset
//! - Logs on stderr (`LOG_FORMAT=json` for JSON lines)
//! - Reports logged, and written to stdout as JSON with `REPORT_FORMAT=json`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scanner_chain::{ChainReader, RpcChainReader};
use scanner_core::config::{build_orchestrator, rpc_url};
use scanner_core::{
    load_settings, BlockWindow, JsonStdoutSink, LogReportSink, ScanError, ScannerService, ScannerSettings,
    TracingEventSink,
};

/// Environment variable names.
mod env {
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const REPORT_FORMAT: &str = "REPORT_FORMAT";
}

const DEFAULT_FILTER: &str = "info,scanner_core=debug,scanner_chain=debug";

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    // Load environment variables
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = load_settings().context("Failed to load scanner settings")?;
    settings.log_config();

    let rpc = RpcChainReader::http(rpc_url(&settings)?)?;
    let head = rpc
        .health_check(Duration::from_millis(settings.scan.per_call_timeout_ms))
        .await
        .context("RPC health check failed")?;
    info!(block = head, "RPC endpoint reachable");
    let reader: Arc<dyn ChainReader> = Arc::new(rpc);

    let orchestrator = build_orchestrator(&settings, reader.clone(), Arc::new(TracingEventSink))?;
    let mut service = ScannerService::new(Arc::new(orchestrator)).with_sink(Arc::new(LogReportSink::default()));
    if std::env::var(env::REPORT_FORMAT).is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        service = service.with_sink(Arc::new(JsonStdoutSink));
    }
    service.start();

    let shutdown = Arc::new(Notify::new());
    {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                service.stop();
                shutdown.notify_one();
            }
        });
    }

    info!(interval_secs = settings.scan.interval().as_secs(), "Starting periodic scans...");
    let mut ticker = tokio::time::interval(settings.scan.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.notified() => break,
        }
        if !service.status().running {
            break;
        }
        scan_once(&service, &settings, reader.as_ref()).await;
    }

    info!("Scanner stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(env::LOG_FORMAT).is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Scan the lookback window ending at the current head.
async fn scan_once(service: &ScannerService, settings: &ScannerSettings, reader: &dyn ChainReader) {
    let timeout = Duration::from_millis(settings.scan.per_call_timeout_ms);
    let head = match reader.block_number(timeout).await {
        Ok(head) => head,
        Err(e) => {
            warn!(error = %e, "Failed to read chain head, skipping cycle");
            return;
        }
    };

    let window = BlockWindow::ending_at(head, settings.scan.lookback_blocks);
    match service.run_scan(settings.scan_config(window)).await {
        Ok(report) => debug!(
            scan_id = %report.scan_id,
            opportunities = report.opportunities.len(),
            complete = report.is_complete(),
            "Cycle finished"
        ),
        Err(ScanError::CycleCanceled) => info!("Cycle canceled"),
        Err(e) => error!(error = %e, "Cycle failed"),
    }
}

fn print_banner() {
    eprintln!(
        r#"
    ┌─┐┌─┐┌─┐┬┌┬┐┬┌─┐┌┐┌  ┌─┐┌─┐┌─┐┌┐┌┌┐┌┌─┐┬─┐
    ├─┘│ │└─┐│ │ ││ ││││  └─┐│  ├─┤││││││├┤ ├┬┘
    ┴  └─┘└─┘┴ ┴ ┴└─┘┘└┘  └─┘└─┘┴ ┴┘└┘┘└┘└─┘┴└─
    Position Scanner v0.1.0
    "#
    );
}
