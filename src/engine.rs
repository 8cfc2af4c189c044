use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::AddressSpec;
use crate::error::ScanError;
use crate::probe::probe;
use crate::report::Reporter;
use crate::types::{PortRange, ProbeResult, ScanSummary, ScanTarget};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_CONCURRENCY: usize = 5_000;

/// Queue capacity as a multiple of the worker count.
const QUEUE_FACTOR: f64 = 1.5;

/// Engine settings, fixed for the engine's lifetime.
#[derive(Clone)]
pub struct EngineConfig {
    /// Number of worker tasks. Keep it moderate: every in-flight probe holds
    /// a local port, and closed sockets linger in TIME_WAIT.
    pub concurrency: usize,
    /// Per-probe connect timeout.
    pub timeout: Duration,
    pub reporter: Arc<dyn Reporter>,
}

impl EngineConfig {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            reporter,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.concurrency == 0 {
            return Err(ScanError::InvalidConfig("concurrency must be greater than zero"));
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(ScanError::InvalidConfig("concurrency must be at most 5000"));
        }
        if self.timeout.is_zero() {
            return Err(ScanError::InvalidConfig("timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        ((self.concurrency as f64 * QUEUE_FACTOR).ceil() as usize).max(1)
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A probe waiting in the queue, bound to the reply channel of the scan call
/// that submitted it.
struct ProbeRequest {
    target: ScanTarget,
    reply: mpsc::Sender<ProbeResult>,
}

/// Cloneable handle that stops an [`Engine`] without owning it.
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancel: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Fixed pool of probe workers draining a shared bounded queue.
///
/// Workers start in [`Engine::new`] and run until [`Engine::stop`]. Any number
/// of scans may run concurrently through one engine; each gets its own reply
/// channel. A stopped engine cannot be restarted.
pub struct Engine {
    config: EngineConfig,
    queue: mpsc::Sender<ProbeRequest>,
    cancel: CancellationToken,
    workers: Mutex<JoinSet<()>>,
}

impl Engine {
    /// Validate `config` and spawn `config.concurrency` workers on the current
    /// Tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self, ScanError> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| ScanError::NoRuntime)?;

        let (queue, rx) = mpsc::channel(config.queue_capacity());
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        let mut workers = JoinSet::new();
        for id in 0..config.concurrency {
            workers.spawn_on(
                run_worker(id, rx.clone(), cancel.clone(), config.timeout),
                &handle,
            );
        }
        debug!(
            concurrency = config.concurrency,
            queue_capacity = config.queue_capacity(),
            timeout_ms = config.timeout.as_millis() as u64,
            "engine started"
        );

        Ok(Self {
            config,
            queue,
            cancel,
            workers: Mutex::new(workers),
        })
    }

    /// Signal every worker, submitter and collector to exit. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("stopping engine");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Stop the engine and wait for every worker task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
        debug!("engine workers joined");
    }

    /// Probe every port of `[port_start, port_end]` on every address of
    /// `address_or_cidr`.
    ///
    /// Only unparseable input is an error. Addresses are scanned one after
    /// another; ports within an address are spread over all workers.
    pub async fn scan(
        &self,
        address_or_cidr: &str,
        port_start: u32,
        port_end: u32,
    ) -> Result<ScanSummary, ScanError> {
        let spec = AddressSpec::parse(address_or_cidr)?;
        let ports = PortRange::normalize(port_start, port_end)?;
        Ok(self.scan_spec(&spec, ports).await)
    }

    /// Probe every port on every address of `address_or_cidr`.
    pub async fn scan_all_ports(&self, address_or_cidr: &str) -> Result<ScanSummary, ScanError> {
        let spec = AddressSpec::parse(address_or_cidr)?;
        Ok(self.scan_spec(&spec, PortRange::FULL).await)
    }

    pub async fn scan_spec(&self, spec: &AddressSpec, ports: PortRange) -> ScanSummary {
        info!(%spec, %ports, "scan started");
        let mut summary = ScanSummary::default();
        for ip in spec.addresses() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            summary.merge(self.scan_ip_port_range(ip, ports).await);
        }
        info!(
            %spec,
            delivered = summary.delivered,
            open = summary.open,
            cancelled = summary.cancelled,
            "scan finished"
        );
        summary
    }

    /// Probe every port of `ports` on a single address.
    ///
    /// Returns after exactly `ports.len()` results were reported, or early if
    /// the engine is stopped. Results reach the reporter in completion order.
    pub async fn scan_ip_port_range(&self, ip: IpAddr, ports: PortRange) -> ScanSummary {
        let expected = ports.len();
        let mut summary = ScanSummary::new(expected as u64);
        if self.cancel.is_cancelled() {
            summary.cancelled = true;
            return summary;
        }

        let (reply_tx, mut reply_rx) = mpsc::channel(expected.min(self.config.queue_capacity()));
        // Releases the submitter if this future is dropped mid-scan.
        let submit_cancel = self.cancel.child_token();
        let submit_guard = submit_cancel.clone().drop_guard();
        let submitter = tokio::spawn(submit(ip, ports, self.queue.clone(), reply_tx, submit_cancel));

        for _ in 0..expected {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                next = reply_rx.recv() => match next {
                    Some(result) => {
                        summary.record(&result);
                        self.config.reporter.report(&result);
                    }
                    // Every pending request was dropped, only possible once stopping.
                    None => {
                        summary.cancelled = true;
                        break;
                    }
                },
            }
        }

        drop(submit_guard);
        if let Err(e) = submitter.await {
            warn!(%ip, "submission task failed: {e}");
        }

        debug!(%ip, delivered = summary.delivered, expected, "address done");
        summary
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Feed one request per port into the shared queue, blocking while it is
/// full, until done or cancelled.
async fn submit(
    ip: IpAddr,
    ports: PortRange,
    queue: mpsc::Sender<ProbeRequest>,
    reply: mpsc::Sender<ProbeResult>,
    cancel: CancellationToken,
) {
    for port in ports.iter() {
        let request = ProbeRequest {
            target: ScanTarget::new(ip, port),
            reply: reply.clone(),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%ip, next_port = port, "submission abandoned");
                return;
            }
            sent = queue.send(request) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<ProbeRequest>>>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = next_request(&queue) => match next {
                Some(request) => request,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = probe(request.target, timeout) => result,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            // The collector may have gone away; the result is simply dropped.
            _ = request.reply.send(result) => {}
        }
    }
    debug!(worker = id, "worker exited");
}

async fn next_request(queue: &Mutex<mpsc::Receiver<ProbeRequest>>) -> Option<ProbeRequest> {
    queue.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn Reporter>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let reporter: Arc<dyn Reporter> = Arc::new(move |_: &ProbeResult| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, reporter)
    }

    #[test]
    fn queue_capacity_is_one_and_a_half_times_concurrency() {
        let (_, reporter) = counting();
        let cfg = EngineConfig::new(reporter);
        assert_eq!(cfg.clone().with_concurrency(1).queue_capacity(), 2);
        assert_eq!(cfg.clone().with_concurrency(2).queue_capacity(), 3);
        assert_eq!(cfg.with_concurrency(1024).queue_capacity(), 1536);
    }

    #[test]
    fn zero_concurrency_or_timeout_is_rejected() {
        let (_, reporter) = counting();
        let cfg = EngineConfig::new(reporter);
        assert!(cfg.clone().with_concurrency(0).validate().is_err());
        assert!(cfg.clone().with_timeout(Duration::ZERO).validate().is_err());
        assert!(cfg.clone().with_concurrency(MAX_CONCURRENCY).validate().is_ok());
        assert_eq!(
            cfg.clone().with_concurrency(MAX_CONCURRENCY + 1).validate(),
            Err(ScanError::InvalidConfig("concurrency must be at most 5000"))
        );
        assert!(cfg.clone().with_concurrency(usize::MAX).validate().is_err());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn engine_requires_a_runtime() {
        let (_, reporter) = counting();
        let err = Engine::new(EngineConfig::new(reporter)).unwrap_err();
        assert_eq!(err, ScanError::NoRuntime);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_joins_workers() {
        let (_, reporter) = counting();
        let engine = Engine::new(EngineConfig::new(reporter).with_concurrency(3)).unwrap();
        let handle = engine.stop_handle();
        engine.stop();
        handle.stop();
        engine.stop();
        assert!(handle.is_stopped());
        tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .expect("workers exit after stop");
    }

    #[tokio::test]
    async fn scan_after_stop_returns_immediately() {
        let (count, reporter) = counting();
        let engine = Engine::new(EngineConfig::new(reporter)).unwrap();
        engine.stop();
        let summary = engine.scan("127.0.0.1", 1, 1000).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.delivered, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_input_is_an_error() {
        let (_, reporter) = counting();
        let engine = Engine::new(EngineConfig::new(reporter)).unwrap();
        assert!(matches!(
            engine.scan("nope", 1, 2).await,
            Err(ScanError::InvalidAddressSpec { .. })
        ));
        assert!(matches!(
            engine.scan("127.0.0.1", 20, 10).await,
            Err(ScanError::InvalidPortRange { .. })
        ));
    }
}
