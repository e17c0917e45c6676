//! Scanner lifecycle.
//!
//! [`ScannerService`] owns the orchestrator, admits one cycle at a time and
//! delivers finished reports to the configured sinks. Every cycle's
//! cancellation token is a child of the service token, so `stop()` cancels
//! whatever is in flight.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::error::{ScanError, ScanId};
use crate::phase::{CyclePhase, ProtocolPhase};
use crate::report::{ReportSink, ScanReport};
use crate::scanner::ScanOrchestrator;

/// Externally visible service state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    /// Cycle in flight, if any
    pub current_scan_id: Option<ScanId>,
    pub current_phase: CyclePhase,
    pub protocol_phases: BTreeMap<String, ProtocolPhase>,
    /// Last cycle that produced a report
    pub last_scan_id: Option<ScanId>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub completed_cycles: u64,
    pub canceled_cycles: u64,
}

#[derive(Debug)]
struct ActiveScan {
    scan_id: ScanId,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct ServiceState {
    running: bool,
    token: CancellationToken,
    current: Option<ActiveScan>,
    last_scan_id: Option<ScanId>,
    last_completed_at: Option<DateTime<Utc>>,
    completed_cycles: u64,
    canceled_cycles: u64,
}

/// Admits scan cycles and tracks their outcome.
#[derive(Debug, Clone)]
pub struct ScannerService {
    orchestrator: Arc<ScanOrchestrator>,
    sinks: Vec<Arc<dyn ReportSink>>,
    state: Arc<Mutex<ServiceState>>,
}

impl ScannerService {
    pub fn new(orchestrator: Arc<ScanOrchestrator>) -> Self {
        Self {
            orchestrator,
            sinks: Vec::new(),
            state: Arc::new(Mutex::new(ServiceState::default())),
        }
    }

    /// Add a report sink. Sinks receive reports in registration order.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn orchestrator(&self) -> &Arc<ScanOrchestrator> {
        &self.orchestrator
    }

    /// Accept scans. Starting a running service is a no-op.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.running {
            return;
        }
        state.running = true;
        state.token = CancellationToken::new();
        info!(
            protocols = self.orchestrator.protocol_ids().count(),
            venues = self.orchestrator.venue_ids().len(),
            "Scanner service started"
        );
    }

    /// Stop accepting scans and cancel the one in flight.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        state.token.cancel();
        info!(in_flight = state.current.is_some(), "Scanner service stopped");
    }

    pub fn status(&self) -> ServiceStatus {
        let phases = self.orchestrator.phases().snapshot();
        let state = self.state.lock();
        ServiceStatus {
            running: state.running,
            current_scan_id: state.current.as_ref().map(|a| a.scan_id),
            current_phase: phases.cycle,
            protocol_phases: phases.protocols,
            last_scan_id: state.last_scan_id,
            last_completed_at: state.last_completed_at,
            completed_cycles: state.completed_cycles,
            canceled_cycles: state.canceled_cycles,
        }
    }

    /// Validate `config` and start a cycle in the background.
    ///
    /// The report goes to the sinks; the returned id can be passed to
    /// [`abort_scan`](Self::abort_scan).
    pub fn start_scan(&self, config: ScanConfig) -> Result<ScanId, ScanError> {
        let (scan_id, cancel) = self.admit(&config)?;
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.execute(scan_id, config, cancel).await {
                warn!(scan_id = %scan_id, error = %e, "Scan cycle ended without report");
            }
        });
        Ok(scan_id)
    }

    /// Run a cycle to completion. The report is also delivered to the sinks.
    pub async fn run_scan(&self, config: ScanConfig) -> Result<ScanReport, ScanError> {
        let (scan_id, cancel) = self.admit(&config)?;
        self.execute(scan_id, config, cancel).await
    }

    /// Cancel the cycle with `scan_id`. Returns whether it was in flight.
    pub fn abort_scan(&self, scan_id: ScanId) -> bool {
        let state = self.state.lock();
        match &state.current {
            Some(active) if active.scan_id == scan_id => {
                info!(scan_id = %scan_id, "Aborting scan");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn admit(&self, config: &ScanConfig) -> Result<(ScanId, CancellationToken), ScanError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(ScanError::NotRunning);
        }
        if let Some(active) = &state.current {
            return Err(ScanError::Busy(active.scan_id));
        }
        self.orchestrator.validate(config)?;

        let scan_id = Uuid::new_v4();
        let cancel = state.token.child_token();
        state.current = Some(ActiveScan {
            scan_id,
            cancel: cancel.clone(),
        });
        Ok((scan_id, cancel))
    }

    async fn execute(
        &self,
        scan_id: ScanId,
        config: ScanConfig,
        cancel: CancellationToken,
    ) -> Result<ScanReport, ScanError> {
        let result = self.orchestrator.run_cycle(scan_id, &config, cancel).await;

        {
            let mut state = self.state.lock();
            if state.current.as_ref().is_some_and(|a| a.scan_id == scan_id) {
                state.current = None;
            }
            match &result {
                Ok(report) => {
                    state.last_scan_id = Some(scan_id);
                    state.last_completed_at = Some(report.completed_at);
                    state.completed_cycles += 1;
                }
                Err(ScanError::CycleCanceled) => state.canceled_cycles += 1,
                Err(_) => {}
            }
        }

        if let Ok(report) = &result {
            for sink in &self.sinks {
                if let Err(e) = sink.deliver(report).await {
                    error!(scan_id = %scan_id, sink = ?sink, error = %e, "Failed to deliver scan report");
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::BlockWindow;
    use crate::events::TracingEventSink;
    use crate::ranker::RankingPolicy;
    use crate::report::ChannelReportSink;
    use crate::scanner::testing::FakeAdapter;
    use crate::scanner::ProtocolRegistration;
    use scanner_api::QuoteAggregator;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn config() -> ScanConfig {
        ScanConfig {
            protocols: BTreeSet::from(["lend".to_string()]),
            max_users_per_protocol: 10,
            block_window: BlockWindow::new(1, 100),
            venues: BTreeSet::new(),
            per_call_timeout_ms: 1_000,
            per_protocol_deadline_ms: 5_000,
            concurrency: 2,
            grace_ms: 100,
            ranking_policy: RankingPolicy::RatioFirst,
        }
    }

    fn service(adapter: FakeAdapter) -> (ScannerService, tokio::sync::mpsc::Receiver<ScanReport>) {
        let mut orchestrator = ScanOrchestrator::new(QuoteAggregator::default(), Arc::new(TracingEventSink));
        orchestrator
            .register(ProtocolRegistration::new(Arc::new(adapter)))
            .unwrap();
        let (sink, rx) = ChannelReportSink::new(4);
        (ScannerService::new(Arc::new(orchestrator)).with_sink(Arc::new(sink)), rx)
    }

    #[tokio::test]
    async fn test_requires_start() {
        let (service, _rx) = service(FakeAdapter::new("lend"));
        assert_eq!(service.start_scan(config()), Err(ScanError::NotRunning));
        assert!(!service.status().running);
    }

    #[tokio::test]
    async fn test_start_scan_delivers_report() {
        let (service, mut rx) = service(FakeAdapter::new("lend").with_user(1, 1, 50, 100));
        service.start();

        let scan_id = service.start_scan(config()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.scan_id, scan_id);
        assert_eq!(report.opportunities.len(), 1);

        let status = service.status();
        assert_eq!(status.last_scan_id, Some(scan_id));
        assert_eq!(status.last_completed_at, Some(report.completed_at));
        assert_eq!(status.completed_cycles, 1);
        assert_eq!(status.current_scan_id, None);
        assert_eq!(status.current_phase, CyclePhase::Completed);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_work() {
        let (service, _rx) = service(FakeAdapter::new("lend"));
        service.start();

        let bad = ScanConfig {
            protocols: BTreeSet::from(["missing".to_string()]),
            ..config()
        };
        assert!(matches!(service.start_scan(bad), Err(ScanError::Configuration(_))));
        assert_eq!(service.status().current_scan_id, None);
        assert_eq!(service.status().current_phase, CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_busy_then_abort() {
        let adapter = FakeAdapter::new("lend")
            .with_user(1, 1, 50, 100)
            .with_delay(1, Duration::from_secs(30));
        let (service, mut rx) = service(adapter);
        service.start();

        let scan_id = service.start_scan(config()).unwrap();
        assert_eq!(service.start_scan(config()), Err(ScanError::Busy(scan_id)));
        assert_eq!(service.status().current_scan_id, Some(scan_id));

        assert!(!service.abort_scan(Uuid::new_v4()));
        assert!(service.abort_scan(scan_id));

        tokio::time::timeout(Duration::from_secs(5), async {
            while service.status().current_scan_id.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let status = service.status();
        assert_eq!(status.canceled_cycles, 1);
        assert_eq!(status.last_scan_id, None);
        assert_eq!(status.current_phase, CyclePhase::Canceled);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_scan() {
        let adapter = FakeAdapter::new("lend")
            .with_user(1, 1, 50, 100)
            .with_delay(1, Duration::from_secs(30));
        let (service, _rx) = service(adapter);
        service.start();

        let runner = service.clone();
        let handle = tokio::spawn(async move { runner.run_scan(config()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ScanError::CycleCanceled));
        assert!(!service.status().running);
        assert_eq!(service.start_scan(config()), Err(ScanError::NotRunning));
        assert_eq!(service.status().canceled_cycles, 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop_runs_again() {
        let (service, _rx) = service(FakeAdapter::new("lend").with_user(1, 1, 50, 100));
        service.start();
        service.stop();
        service.start();

        let report = service.run_scan(config()).await.unwrap();
        assert_eq!(report.opportunities.len(), 1);
        assert_eq!(service.status().completed_cycles, 1);
    }
}
