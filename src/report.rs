use std::io::Write;
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::{
    self,
    error::{SendError, TrySendError},
};
use tokio::task;
use tracing::{trace, warn};

use crate::services::ServiceTable;
use crate::types::ProbeResult;

/// Receives every completed probe, in completion order.
///
/// Called from whichever task is collecting a scan, possibly from several
/// scans at once. Implementations serialize their own state.
pub trait Reporter: Send + Sync {
    fn report(&self, result: &ProbeResult);
}

impl<F> Reporter for F
where
    F: Fn(&ProbeResult) + Send + Sync,
{
    fn report(&self, result: &ProbeResult) {
        self(result)
    }
}

/// Prints results to stdout. Terse mode only prints open ports; verbose mode
/// prints every result and sends failure causes to stderr.
#[derive(Debug, Clone)]
pub struct ConsoleReporter {
    verbose: bool,
    services: Arc<ServiceTable>,
}

impl ConsoleReporter {
    pub fn new(services: Arc<ServiceTable>, verbose: bool) -> Self {
        Self { verbose, services }
    }

    /// The stdout line for `result`, if any.
    pub fn format_line(&self, result: &ProbeResult) -> Option<String> {
        let name = self.services.resolve(result.target.port());
        match (self.verbose, result.open) {
            (false, true) => Some(format!("{} [ {} ] is open", result.target, name)),
            (false, false) => None,
            (true, true) => Some(format!("{} {} is open", result.target, name)),
            (true, false) => Some(format!("{} {} is closed", result.target, name)),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn report(&self, result: &ProbeResult) {
        if self.verbose {
            if let Some(failure) = &result.failure {
                eprintln!("error: {} {}", result.target, failure);
            }
        }
        if let Some(line) = self.format_line(result) {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{line}");
        }
    }
}

/// Default buffer between the collecting task and a [`ChannelReporter`]
/// consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Forwards results into a bounded channel so an async consumer can stream
/// them elsewhere.
///
/// When the channel is full the collecting task blocks until the consumer
/// catches up, so a slow consumer slows the scan down instead of buffering.
/// Waiting needs a multi-threaded runtime. A consumer that stops reading must
/// drop its receiver; results are discarded from then on.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<ProbeResult>,
}

impl ChannelReporter {
    pub fn new(tx: mpsc::Sender<ProbeResult>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProbeResult>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn send_blocking(&self, result: ProbeResult) -> Result<(), SendError<ProbeResult>> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                warn!(target = %result.target, "cannot wait for consumer on a current-thread runtime, dropping result");
                Ok(())
            }
            Ok(_) => task::block_in_place(|| self.tx.blocking_send(result)),
            Err(_) => self.tx.blocking_send(result),
        }
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, result: &ProbeResult) {
        let sent = match self.tx.try_send(result.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(result)) => self.send_blocking(result),
            Err(TrySendError::Closed(result)) => Err(SendError(result)),
        };
        if sent.is_err() {
            trace!(target = %result.target, "result receiver closed, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProbeFailure, ScanTarget};
    use std::net::{IpAddr, Ipv4Addr};

    fn result(port: u16, open: bool) -> ProbeResult {
        ProbeResult {
            target: ScanTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            open,
            failure: (!open).then_some(ProbeFailure::Refused),
            elapsed_ms: 1,
        }
    }

    fn services() -> Arc<ServiceTable> {
        Arc::new(ServiceTable::parse_str("ssh 22/tcp\n"))
    }

    #[test]
    fn terse_console_prints_only_open() {
        let r = ConsoleReporter::new(services(), false);
        assert_eq!(
            r.format_line(&result(22, true)).as_deref(),
            Some("127.0.0.1:22 [ ssh ] is open")
        );
        assert_eq!(r.format_line(&result(23, false)), None);
    }

    #[test]
    fn verbose_console_prints_everything() {
        let r = ConsoleReporter::new(services(), true);
        assert_eq!(
            r.format_line(&result(23, false)).as_deref(),
            Some("127.0.0.1:23 23 is closed")
        );
    }

    #[test]
    fn channel_reporter_forwards_and_tolerates_closed_receiver() {
        let (reporter, mut rx) = ChannelReporter::channel(4);
        reporter.report(&result(22, true));
        assert_eq!(rx.try_recv().unwrap(), result(22, true));
        drop(rx);
        reporter.report(&result(22, true));
    }
}
