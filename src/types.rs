use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::error::ScanError;

pub const MIN_PORT: u16 = 1;
pub const MAX_PORT: u16 = u16::MAX;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    V4,
    V6,
}

/// One TCP endpoint to probe.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanTarget {
    addr: SocketAddr,
}

impl ScanTarget {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn family(&self) -> Family {
        match self.addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// Why a probe did not reach an open port.
#[derive(Serialize, Error, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeFailure {
    #[error("i/o timeout")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("{0}")]
    Other(String),
}

/// Outcome of a single probe.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub target: ScanTarget,
    pub open: bool,
    pub failure: Option<ProbeFailure>,
    pub elapsed_ms: u64,
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reachable = if self.open { "reachable" } else { "not reachable" };
        write!(f, "{} is {}", self.target, reachable)
    }
}

/// Inclusive, validated TCP port range.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Every valid port, `1..=65535`.
    pub const FULL: PortRange = PortRange {
        start: MIN_PORT,
        end: MAX_PORT,
    };

    pub fn new(start: u16, end: u16) -> Result<Self, ScanError> {
        Self::normalize(start.into(), end.into())
    }

    /// Clamp caller-supplied bounds into `1..=65535`.
    ///
    /// `end` above 65535 is clamped down and a `start` of 0 is raised to 1.
    /// A `start` beyond the clamped `end` is rejected rather than collapsed.
    pub fn normalize(start: u32, end: u32) -> Result<Self, ScanError> {
        let clamped_end = end.min(u32::from(MAX_PORT));
        let clamped_start = start.max(u32::from(MIN_PORT));
        if clamped_start > clamped_end {
            return Err(ScanError::InvalidPortRange { start, end });
        }
        Ok(Self {
            start: clamped_start as u16,
            end: clamped_end as u16,
        })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports in the range, never zero.
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Counters for one range-scan call.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub expected: u64,
    pub delivered: u64,
    pub open: u64,
    pub cancelled: bool,
}

impl ScanSummary {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: &ProbeResult) {
        self.delivered += 1;
        if result.open {
            self.open += 1;
        }
    }

    pub fn merge(&mut self, other: ScanSummary) {
        self.expected += other.expected;
        self.delivered += other.delivered;
        self.open += other.open;
        self.cancelled |= other.cancelled;
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.delivered == self.expected
    }
}
