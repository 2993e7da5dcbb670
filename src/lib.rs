//! Async driver for up to six SPI quadrature-encoder chips behind a 3-line
//! address decoder.
//!
//! All encoders share one SPI bus. Three GPIO lines drive a decoder whose
//! outputs act as the chip selects, so exactly one chip is addressed at a
//! time and the all-high pattern leaves every chip idle.
//!
//! # Architecture
//!
//! - **[`Link`]** owns a bus controller and the negotiated mode, clock and
//!   word size, and counts every byte exchanged.
//! - **[`ChannelSelector`]** maps channels 1..=6 to address patterns through
//!   a validated [`AddressTable`].
//! - **[`EncoderBus`]** speaks the encoder register protocol: program the
//!   mode register, read the 32-bit position counter.
//! - **[`PollingLoop`]** programs every channel once and then reads them in
//!   cycles, feeding a [`RateMonitor`].
//! - **[`ThroughputTest`]** pushes random buffers through a link for board
//!   bring-up, verifying them in loopback mode.
//!
//! The bus controller is the [`SpiController`] trait. [`HalController`]
//! implements it for any `embedded-hal-async` SPI bus; `SpidevController`
//! implements it for Linux with the `spidev` feature and opens the device
//! named by [`LinkConfig::device`] through `SpidevController::open_config`.
//!
//! # Quick start
//!
//! ```ignore
//! use encoder_mux::{
//!     AddressTable, ChannelSelector, EncoderBus, HalController, Link, LinkConfig, ModeFlags,
//!     PollConfig, PollEvent, PollingLoop,
//! };
//!
//! let controller = HalController::new(spi, embassy_time::Delay, ModeFlags::empty(), 500_000);
//! let (link, negotiation) = Link::open(controller, LinkConfig::default()).await?;
//! let selector = ChannelSelector::new([a0, a1, a2], AddressTable::default())?;
//!
//! let config = PollConfig { channels: 6, cycles: Some(10), ..PollConfig::default() };
//! let mut poller = PollingLoop::new(EncoderBus::new(link, selector), config)?;
//! let summary = poller
//!     .run(|event| {
//!         if let PollEvent::Cycle(result) = event {
//!             // result.angles[0] is channel 1
//!         }
//!     })
//!     .await?;
//! ```
//!
//! # Crate Features
//!
//! - **`defmt`** - structured logging via [`defmt`] and `defmt::Format` on
//!   public types.
//! - **`std`** - host builds; links the `embassy-time` std time driver.
//! - **`spidev`** - Linux `SpidevController` (implies `std`).

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod encoder;
pub mod error;
pub mod hal;
pub mod link;
pub mod poller;
pub mod rate;
pub mod registers;
pub mod selector;
pub mod selftest;
#[cfg(feature = "spidev")]
pub mod spidev;

#[cfg(test)]
mod mock;

// ── Re-exports for convenience ───────────────────────────────────────────

pub use encoder::{to_angle, EncoderBus, RegisterState};
pub use error::{ConfigError, Error, ErrorKind};
pub use hal::HalController;
pub use link::{
    compare_loopback, ByteDiff, Link, LinkConfig, LinkError, LinkParams, LoopbackMismatch,
    Mismatch, ModeFlags, Negotiation, SpiController, Transfer,
};
pub use poller::{CancelToken, CycleResult, PollConfig, PollEvent, PollState, PollingLoop, RunSummary};
pub use rate::{ByteCounters, RateMonitor, RateReport, Totals};
pub use selector::{AddressTable, Channel, ChannelSelector, SelectError};
pub use selftest::{LenientReport, SelfTestError, ThroughputTest};
#[cfg(feature = "spidev")]
pub use crate::spidev::{SpidevController, SpidevError};
