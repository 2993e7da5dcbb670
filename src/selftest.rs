//! Bulk-transfer throughput test.
//!
//! Pushes pseudo-random buffers through a [`Link`] and, when loopback is
//! negotiated, checks that every byte came back. Useful for bring-up of a
//! new board before any encoder is attached.

use core::convert::Infallible;

use embassy_time::{Duration, Instant};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::error::{ConfigError, Error};
use crate::link::{Link, LoopbackMismatch, SpiController};
use crate::rate::{RateMonitor, RateReport, Totals};
use crate::registers::DEFAULT_REPORT_INTERVAL_MS;

/// Largest buffer a single test exchange may use.
pub const MAX_TRANSFER_SIZE: usize = 4096;

/// Errors from the self-test. No select lines are involved.
pub type SelfTestError<E> = Error<E, Infallible>;

/// Self-test parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThroughputTest {
    /// Bytes per exchange, at most [`MAX_TRANSFER_SIZE`].
    pub transfer_size: usize,
    pub iterations: u32,
    pub report_interval: Duration,
    /// Seed for the buffer contents. Equal seeds give equal data.
    pub seed: u64,
}

impl Default for ThroughputTest {
    fn default() -> Self {
        Self {
            transfer_size: 32,
            iterations: 1,
            report_interval: Duration::from_millis(DEFAULT_REPORT_INTERVAL_MS),
            seed: 0,
        }
    }
}

/// Outcome of [`ThroughputTest::run_lenient`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LenientReport {
    pub totals: Totals,
    /// Exchanges whose loopback data did not match.
    pub mismatched: u32,
    pub first_mismatch: Option<LoopbackMismatch>,
}

impl ThroughputTest {
    /// # Errors
    /// * [`ConfigError::TransferSize`] if `transfer_size` exceeds
    ///   [`MAX_TRANSFER_SIZE`]
    /// * [`ConfigError::ZeroInterval`] if `report_interval` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_size > MAX_TRANSFER_SIZE {
            return Err(ConfigError::TransferSize(self.transfer_size));
        }
        if self.report_interval.as_ticks() == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    /// Run all iterations, stopping at the first loopback mismatch.
    ///
    /// `on_report` is called whenever a rate report is due. Returns the
    /// bytes moved by this run.
    ///
    /// # Errors
    /// * [`Error::Config`] if the parameters are invalid
    /// * [`Error::Spi`] or [`Error::ShortTransfer`] on bus failure
    /// * [`Error::Loopback`] with the differing bytes
    pub async fn run<C, F>(
        &self,
        link: &mut Link<C>,
        on_report: F,
    ) -> Result<Totals, SelfTestError<C::Error>>
    where
        C: SpiController,
        F: FnMut(RateReport),
    {
        let report = self
            .drive(link, on_report, |mismatch| Err(Error::Loopback(mismatch)))
            .await?;
        Ok(report.totals)
    }

    /// Like [`run`](Self::run) but counts loopback mismatches and keeps
    /// going. Bus failures still abort.
    pub async fn run_lenient<C, F>(
        &self,
        link: &mut Link<C>,
        on_report: F,
    ) -> Result<LenientReport, SelfTestError<C::Error>>
    where
        C: SpiController,
        F: FnMut(RateReport),
    {
        self.drive(link, on_report, |_| Ok(())).await
    }

    async fn drive<C, F, M>(
        &self,
        link: &mut Link<C>,
        mut on_report: F,
        mut on_mismatch: M,
    ) -> Result<LenientReport, SelfTestError<C::Error>>
    where
        C: SpiController,
        F: FnMut(RateReport),
        M: FnMut(LoopbackMismatch) -> Result<(), SelfTestError<C::Error>>,
    {
        self.validate()?;

        let start = link.counters();
        let mut monitor =
            RateMonitor::new(self.report_interval, Instant::now())?.with_baseline(start);
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut result = LenientReport {
            totals: Totals::default(),
            mismatched: 0,
            first_mismatch: None,
        };

        let len = self.transfer_size;
        let mut tx = [0u8; MAX_TRANSFER_SIZE];
        let mut rx = [0u8; MAX_TRANSFER_SIZE];

        for _ in 0..self.iterations {
            rng.fill_bytes(&mut tx[..len]);
            rx[..len].fill(0);

            link.exchange(&tx[..len], &mut rx[..len]).await?;

            if let Err(mismatch) = link.verify_loopback(&tx[..len], &rx[..len]) {
                #[cfg(feature = "defmt")]
                defmt::warn!("{}", mismatch);

                result.mismatched += 1;
                if result.first_mismatch.is_none() {
                    result.first_mismatch = Some(mismatch.clone());
                }
                on_mismatch(mismatch)?;
            }

            if let Some(report) = monitor.maybe_report(Instant::now(), link.counters()) {
                #[cfg(feature = "defmt")]
                defmt::info!("{}", report);

                on_report(report);
            }
        }

        let end = link.counters();
        result.totals = Totals {
            tx_bytes: end.tx_bytes() - start.tx_bytes(),
            rx_bytes: end.rx_bytes() - start.rx_bytes(),
        };

        #[cfg(feature = "defmt")]
        defmt::info!("{}", result.totals);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkConfig, ModeFlags};
    use crate::mock::{MockController, MockError};
    use embassy_futures::block_on;

    fn open(controller: MockController, mode: ModeFlags) -> Link<MockController> {
        let config = LinkConfig::default().with_mode(mode);
        block_on(Link::open(controller, config)).unwrap().0
    }

    fn test(transfer_size: usize, iterations: u32) -> ThroughputTest {
        ThroughputTest {
            transfer_size,
            iterations,
            ..ThroughputTest::default()
        }
    }

    #[test]
    fn loopback_run_counts_bytes() {
        let mut link = open(MockController::new(), ModeFlags::LOOP);

        let totals = block_on(test(16, 3).run(&mut link, |_| {})).unwrap();

        assert_eq!(totals.tx_bytes, 48);
        assert_eq!(totals.rx_bytes, 48);
        assert_eq!(link.controller().transfers().len(), 3);
    }

    #[test]
    fn buffers_follow_the_seed() {
        let mut a = open(MockController::new(), ModeFlags::LOOP);
        let mut b = open(MockController::new(), ModeFlags::LOOP);
        let mut c = open(MockController::new(), ModeFlags::LOOP);
        let seeded = |seed| ThroughputTest { seed, ..test(8, 2) };

        block_on(seeded(7).run(&mut a, |_| {})).unwrap();
        block_on(seeded(7).run(&mut b, |_| {})).unwrap();
        block_on(seeded(8).run(&mut c, |_| {})).unwrap();

        let sent = |link: &Link<MockController>| {
            link.controller()
                .transfers()
                .iter()
                .map(|t| t.tx.clone())
                .collect::<std::vec::Vec<_>>()
        };
        assert_eq!(sent(&a), sent(&b));
        assert_ne!(sent(&a), sent(&c));
        // Consecutive buffers differ.
        assert_ne!(sent(&a)[0], sent(&a)[1]);
    }

    #[test]
    fn mismatch_reports_differing_bytes() {
        let mut link = open(MockController::new().corrupting(2, 0x01), ModeFlags::LOOP);
        let seeded = ThroughputTest { seed: 3, ..test(8, 4) };

        let result = block_on(seeded.run(&mut link, |_| {}));

        let mismatch = match result {
            Err(Error::Loopback(mismatch)) => mismatch,
            other => panic!("expected a loopback mismatch, got {:?}", other),
        };
        assert_eq!(mismatch.count, 1);
        assert_eq!(mismatch.len, 8);
        assert_eq!(mismatch.diffs.len(), 1);
        let diff = mismatch.diffs[0];
        assert_eq!(diff.offset, 2);
        assert_eq!(diff.received, diff.sent ^ 0x01);
        // Stopped after the first exchange.
        assert_eq!(link.controller().transfers().len(), 1);
    }

    #[test]
    fn lenient_run_counts_mismatches() {
        let mut link = open(MockController::new().corrupting(0, 0xFF), ModeFlags::LOOP);

        let report = block_on(test(4, 5).run_lenient(&mut link, |_| {})).unwrap();

        assert_eq!(report.mismatched, 5);
        assert_eq!(report.totals.tx_bytes, 20);
        let first = report.first_mismatch.unwrap();
        assert_eq!(first.diffs[0].offset, 0);
    }

    #[test]
    fn no_integrity_check_without_loopback() {
        let mut link = open(MockController::new().corrupting(0, 0xFF), ModeFlags::empty());

        let report = block_on(test(4, 2).run_lenient(&mut link, |_| {})).unwrap();

        assert_eq!(report.mismatched, 0);
        assert!(report.first_mismatch.is_none());
    }

    #[test]
    fn totals_exclude_earlier_traffic() {
        let mut link = open(MockController::new(), ModeFlags::LOOP);
        block_on(link.exchange(&[1, 2, 3], &mut [0; 3])).unwrap();

        let totals = block_on(test(10, 1).run(&mut link, |_| {})).unwrap();

        assert_eq!(totals.tx_bytes, 10);
        assert_eq!(link.counters().tx_bytes(), 13);
    }

    #[test]
    fn invalid_parameters_touch_nothing() {
        let mut link = open(MockController::new(), ModeFlags::LOOP);

        let too_big = test(MAX_TRANSFER_SIZE + 1, 1);
        assert!(matches!(
            block_on(too_big.run(&mut link, |_| {})),
            Err(Error::Config(ConfigError::TransferSize(_)))
        ));
        let zero = ThroughputTest {
            report_interval: Duration::from_ticks(0),
            ..test(4, 1)
        };
        assert!(matches!(
            block_on(zero.run(&mut link, |_| {})),
            Err(Error::Config(ConfigError::ZeroInterval))
        ));
        assert!(link.controller().transfers().is_empty());
    }

    #[test]
    fn bus_failure_aborts_lenient_run() {
        let mut link = open(MockController::new().failing_transfer(1), ModeFlags::LOOP);

        let result = block_on(test(4, 3).run_lenient(&mut link, |_| {}));

        assert!(matches!(result, Err(Error::Spi(MockError::Transfer))));
    }
}
