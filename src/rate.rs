//! Byte accounting and periodic throughput reports.

use core::fmt;

use embassy_time::{Duration, Instant};

use crate::error::ConfigError;

/// Cumulative bytes moved over a link. Never reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ByteCounters {
    tx_bytes: u64,
    rx_bytes: u64,
}

impl ByteCounters {
    /// Count one full-duplex exchange of `len` bytes.
    pub(crate) fn record(&mut self, len: usize) {
        self.tx_bytes += len as u64;
        self.rx_bytes += len as u64;
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    pub fn totals(&self) -> Totals {
        Totals {
            tx_bytes: self.tx_bytes,
            rx_bytes: self.rx_bytes,
        }
    }
}

/// Throughput over one report interval, in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RateReport {
    pub tx_kbps: f64,
    pub rx_kbps: f64,
}

impl fmt::Display for RateReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rate: tx {:.1}kbps, rx {:.1}kbps", self.tx_kbps, self.rx_kbps)
    }
}

/// Byte totals for an end-of-run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Totals {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl Totals {
    pub fn tx_kib(&self) -> f64 {
        self.tx_bytes as f64 / 1024.0
    }

    pub fn rx_kib(&self) -> f64 {
        self.rx_bytes as f64 / 1024.0
    }
}

impl fmt::Display for Totals {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "total: tx {:.1}KB, rx {:.1}KB", self.tx_kib(), self.rx_kib())
    }
}

/// Emits a [`RateReport`] once per elapsed interval.
///
/// Keeps a snapshot of the counters at the last report; the cumulative
/// counters themselves live on the link and are only read here.
#[derive(Debug, Clone, Copy)]
pub struct RateMonitor {
    interval: Duration,
    last_report: Instant,
    baseline: ByteCounters,
}

impl RateMonitor {
    /// # Errors
    /// [`ConfigError::ZeroInterval`] if `interval` is zero.
    pub fn new(interval: Duration, start: Instant) -> Result<Self, ConfigError> {
        if interval.as_ticks() == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(Self {
            interval,
            last_report: start,
            baseline: ByteCounters::default(),
        })
    }

    /// Start from counters that already carry traffic.
    pub fn with_baseline(mut self, counters: ByteCounters) -> Self {
        self.baseline = counters;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Report if more than one interval has passed since the last report.
    ///
    /// Rates are computed over the nominal interval, not the measured
    /// elapsed time. Reporting moves the baseline to `counters` and the
    /// report time to `now`.
    pub fn maybe_report(&mut self, now: Instant, counters: ByteCounters) -> Option<RateReport> {
        let elapsed = now.checked_duration_since(self.last_report)?;
        if elapsed <= self.interval {
            return None;
        }

        let interval_ms = self.interval.as_millis().max(1) as f64;
        let tx_delta = counters.tx_bytes.saturating_sub(self.baseline.tx_bytes);
        let rx_delta = counters.rx_bytes.saturating_sub(self.baseline.rx_bytes);

        self.last_report = now;
        self.baseline = counters;

        Some(RateReport {
            tx_kbps: (tx_delta * 8) as f64 / interval_ms,
            rx_kbps: (rx_delta * 8) as f64 / interval_ms,
        })
    }
}
