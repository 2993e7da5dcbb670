//! Timed polling of every configured encoder.
//!
//! [`PollingLoop`] walks `Setup → Programming → Ready → Polling → Done`:
//!
//! 1. **Programming**: channels `1..=N` in ascending order are deselected,
//!    then programmed. Any failure aborts the whole sequence.
//! 2. **Polling**: each cycle reads channels `1..=N` in ascending order
//!    and yields one [`CycleResult`] with all N angles. After each cycle the
//!    [`RateMonitor`] is consulted.
//! 3. **Done**: the cycle budget is spent, or cancellation was requested.
//!
//! The loop is a producer: call [`next_cycle`](PollingLoop::next_cycle)
//! until it returns `None`, or hand a sink to [`run`](PollingLoop::run).
//! A [`CancelToken`] is checked before every cycle and between channels;
//! a cancelled cycle is dropped rather than emitted half-filled.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_time::{Duration, Instant};
use embedded_hal::digital::OutputPin;
use heapless::Vec;

use crate::encoder::{to_angle, EncoderBus};
use crate::error::{ConfigError, Error};
use crate::link::SpiController;
use crate::rate::{RateMonitor, RateReport, Totals};
use crate::registers::{DEFAULT_REPORT_INTERVAL_MS, MAX_CHANNELS};
use crate::selector::Channel;

/// Cooperative stop signal for a running [`PollingLoop`].
///
/// Can live in a `static` and be set from an interrupt or another task.
#[derive(Debug, Default)]
pub struct CancelToken(AtomicBool);

impl CancelToken {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PollConfig {
    /// Encoders on channels `1..=channels`. Default: 6.
    pub channels: usize,
    /// Number of polling cycles; `None` runs a single cycle.
    pub cycles: Option<u32>,
    /// Interval between throughput reports. Default: 5 s.
    pub report_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            channels: MAX_CHANNELS,
            cycles: None,
            report_interval: Duration::from_millis(DEFAULT_REPORT_INTERVAL_MS),
        }
    }
}

impl PollConfig {
    /// # Errors
    /// * [`ConfigError::ChannelCount`] if `channels` is outside 1..=6
    /// * [`ConfigError::ZeroInterval`] if `report_interval` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CHANNELS).contains(&self.channels) {
            return Err(ConfigError::ChannelCount(self.channels));
        }
        if self.report_interval.as_ticks() == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollState {
    Setup,
    /// Programming in progress; holds the channel being programmed.
    Programming(u8),
    Ready,
    /// Polling; holds the index of the next cycle.
    Polling(u32),
    Done,
    /// A sub-operation failed; the loop yields nothing more.
    Failed,
}

/// Angles from one pass over all configured channels.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CycleResult {
    /// Zero-based cycle index.
    pub cycle: u32,
    /// Raw counters; slot `i` is channel `i + 1`.
    pub counters: Vec<u32, MAX_CHANNELS>,
    /// Angles in degrees; slot `i` is channel `i + 1`.
    pub angles: Vec<f64, MAX_CHANNELS>,
}

impl CycleResult {
    pub fn angle(&self, channel: Channel) -> Option<f64> {
        self.angles.get(channel.index()).copied()
    }
}

impl fmt::Display for CycleResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Angle:")?;
        for (i, angle) in self.angles.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{:.2}°", sep, angle)?;
        }
        Ok(())
    }
}

/// Outcome of [`PollingLoop::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RunSummary {
    /// Cycles emitted.
    pub cycles: u32,
    /// Whether the run was stopped through the [`CancelToken`].
    pub cancelled: bool,
    /// Bytes moved over the link since it was opened.
    pub totals: Totals,
}

/// Something the loop hands to a [`run`](PollingLoop::run) sink.
#[derive(Debug)]
pub enum PollEvent<'r> {
    Cycle(&'r CycleResult),
    Rate(&'r RateReport),
}

/// Programs and then polls the encoders on an [`EncoderBus`].
pub struct PollingLoop<'a, C, P> {
    bus: EncoderBus<C, P>,
    config: PollConfig,
    state: PollState,
    remaining: u32,
    cancel: Option<&'a CancelToken>,
    cancelled: bool,
    monitor: Option<RateMonitor>,
    pending_report: Option<RateReport>,
}

impl<'a, C, P> PollingLoop<'a, C, P>
where
    C: SpiController,
    P: OutputPin,
{
    /// # Errors
    /// [`Error::Config`] if `config` fails [`PollConfig::validate`].
    pub fn new(bus: EncoderBus<C, P>, config: PollConfig) -> Result<Self, Error<C::Error, P::Error>> {
        config.validate()?;
        Ok(Self {
            bus,
            config,
            state: PollState::Setup,
            remaining: config.cycles.unwrap_or(1),
            cancel: None,
            cancelled: false,
            monitor: None,
            pending_report: None,
        })
    }

    /// Stop when `token` is cancelled.
    pub fn with_cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn bus(&self) -> &EncoderBus<C, P> {
        &self.bus
    }

    /// Give back the bus.
    pub fn release(self) -> EncoderBus<C, P> {
        self.bus
    }

    /// Program channels `1..=N`. Called by the first
    /// [`next_cycle`](Self::next_cycle) if not called before.
    ///
    /// # Errors
    /// The first failing sub-operation; the loop moves to
    /// [`PollState::Failed`].
    pub async fn program_all(&mut self) -> Result<(), Error<C::Error, P::Error>> {
        if self.state != PollState::Setup {
            return Ok(());
        }
        match self.program_channels().await {
            Ok(()) => {
                self.state = PollState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = PollState::Failed;
                Err(e)
            }
        }
    }

    async fn program_channels(&mut self) -> Result<(), Error<C::Error, P::Error>> {
        for channel in Channel::first(self.config.channels)? {
            self.state = PollState::Programming(channel.id());
            self.bus.deselect()?;
            self.bus.program(channel.id()).await?;
        }
        self.bus.deselect()?;

        #[cfg(feature = "defmt")]
        defmt::info!("{} encoders programmed", self.config.channels);

        Ok(())
    }

    /// Produce the next cycle.
    ///
    /// Returns `None` once the cycle budget is spent, after cancellation,
    /// or after an error has been returned.
    pub async fn next_cycle(&mut self) -> Option<Result<CycleResult, Error<C::Error, P::Error>>> {
        match self.state {
            PollState::Done | PollState::Failed => return None,
            PollState::Setup | PollState::Programming(_) => {
                if let Err(e) = self.program_all().await {
                    return Some(Err(e));
                }
            }
            PollState::Ready | PollState::Polling(_) => {}
        }

        if self.remaining == 0 {
            self.state = PollState::Done;
            return None;
        }
        if self.cancel_requested() {
            return self.stop_cancelled();
        }

        let cycle = match self.state {
            PollState::Polling(cycle) => cycle,
            _ => {
                let now = Instant::now();
                let monitor = RateMonitor::new(self.config.report_interval, now)
                    .map(|m| m.with_baseline(self.bus.link().counters()));
                match monitor {
                    Ok(m) => self.monitor = Some(m),
                    Err(e) => {
                        self.state = PollState::Failed;
                        return Some(Err(e.into()));
                    }
                }
                0
            }
        };
        self.state = PollState::Polling(cycle);

        match self.poll_cycle(cycle).await {
            Ok(Some(result)) => {
                self.remaining -= 1;
                self.state = if self.remaining == 0 {
                    PollState::Done
                } else {
                    PollState::Polling(cycle + 1)
                };
                if let Some(monitor) = self.monitor.as_mut() {
                    self.pending_report =
                        monitor.maybe_report(Instant::now(), self.bus.link().counters());
                }
                Some(Ok(result))
            }
            Ok(None) => self.stop_cancelled(),
            Err(e) => {
                self.state = PollState::Failed;
                Some(Err(e))
            }
        }
    }

    /// Read every channel once. `Ok(None)` means cancelled mid-cycle.
    async fn poll_cycle(
        &mut self,
        cycle: u32,
    ) -> Result<Option<CycleResult>, Error<C::Error, P::Error>> {
        let mut result = CycleResult {
            cycle,
            counters: Vec::new(),
            angles: Vec::new(),
        };

        for channel in Channel::first(self.config.channels)? {
            if self.cancel_requested() {
                return Ok(None);
            }
            let counter = self.bus.read_channel(channel).await?;
            // At most MAX_CHANNELS slots are filled.
            let _ = result.counters.push(counter);
            let _ = result.angles.push(to_angle(counter));
        }

        Ok(Some(result))
    }

    /// The rate report produced after the last cycle, if one was due.
    pub fn take_rate_report(&mut self) -> Option<RateReport> {
        self.pending_report.take()
    }

    /// Drain the loop into `sink` and summarise.
    ///
    /// # Errors
    /// The first error from programming or polling; nothing is retried.
    pub async fn run<F>(&mut self, mut sink: F) -> Result<RunSummary, Error<C::Error, P::Error>>
    where
        F: FnMut(PollEvent<'_>),
    {
        let mut cycles = 0;
        while let Some(result) = self.next_cycle().await {
            let result = result?;
            cycles += 1;

            #[cfg(feature = "defmt")]
            defmt::debug!("{}", result);

            sink(PollEvent::Cycle(&result));

            if let Some(report) = self.take_rate_report() {
                #[cfg(feature = "defmt")]
                defmt::info!("{}", report);

                sink(PollEvent::Rate(&report));
            }
        }

        let totals = self.bus.link().counters().totals();

        #[cfg(feature = "defmt")]
        defmt::info!("{} cycles, {}", cycles, totals);

        Ok(RunSummary {
            cycles,
            cancelled: self.cancelled,
            totals,
        })
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.map_or(false, CancelToken::is_cancelled)
    }

    fn stop_cancelled(&mut self) -> Option<Result<CycleResult, Error<C::Error, P::Error>>> {
        self.cancelled = true;
        self.state = PollState::Done;
        match self.bus.deselect() {
            Ok(()) => None,
            Err(e) => {
                self.state = PollState::Failed;
                Some(Err(e))
            }
        }
    }
}
