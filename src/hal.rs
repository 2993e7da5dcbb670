//! [`SpiController`] for any `embedded-hal-async` SPI bus.
//!
//! MCU HALs fix mode and clock when the peripheral is built, so
//! [`HalController`] is constructed with those settings and reports them on
//! read-back. Parameter writes are accepted but change nothing; the
//! [`Negotiation`](crate::Negotiation) returned by
//! [`Link::open`](crate::Link::open) shows any request the bus could not
//! honour. Transfers are always single-line.

use embedded_hal::spi::{Mode, Phase, Polarity};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiBus;

use crate::link::{ModeFlags, SpiController, Transfer};

impl ModeFlags {
    /// Clock polarity and phase bits for an `embedded-hal` SPI mode.
    pub fn from_hal_mode(mode: Mode) -> Self {
        let mut flags = ModeFlags::empty();
        if mode.polarity == Polarity::IdleHigh {
            flags |= ModeFlags::CPOL;
        }
        if mode.phase == Phase::CaptureOnSecondTransition {
            flags |= ModeFlags::CPHA;
        }
        flags
    }
}

/// Wraps an `embedded-hal-async` [`SpiBus`] and a delay source.
///
/// The delay provides the per-transfer `delay_us`; pass
/// `embassy_time::Delay` on embassy targets.
pub struct HalController<B, D> {
    bus: B,
    delay: D,
    mode: ModeFlags,
    speed_hz: u32,
}

impl<B, D> HalController<B, D>
where
    B: SpiBus,
    D: DelayNs,
{
    /// # Arguments
    /// * `bus` - configured SPI bus (8-bit words)
    /// * `delay` - delay source for the post-transfer delay
    /// * `mode` - mode the bus was configured with; width flags are dropped
    /// * `speed_hz` - clock the bus was configured with
    pub fn new(bus: B, delay: D, mode: ModeFlags, speed_hz: u32) -> Self {
        Self {
            bus,
            delay,
            mode: mode - ModeFlags::TX_WIDE - ModeFlags::RX_WIDE,
            speed_hz,
        }
    }

    /// Give back the bus and the delay source.
    pub fn release(self) -> (B, D) {
        (self.bus, self.delay)
    }
}

impl<B, D> SpiController for HalController<B, D>
where
    B: SpiBus,
    D: DelayNs,
{
    type Error = B::Error;

    async fn write_mode(&mut self, _mode: ModeFlags) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn read_mode(&mut self) -> Result<ModeFlags, Self::Error> {
        Ok(self.mode)
    }

    async fn write_bits_per_word(&mut self, _bits: u8) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn read_bits_per_word(&mut self) -> Result<u8, Self::Error> {
        Ok(8)
    }

    async fn write_max_speed_hz(&mut self, _speed_hz: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn read_max_speed_hz(&mut self) -> Result<u32, Self::Error> {
        Ok(self.speed_hz)
    }

    async fn transfer(&mut self, transfer: &mut Transfer<'_>) -> Result<usize, Self::Error> {
        match (transfer.tx, transfer.rx.as_deref_mut()) {
            (Some(tx), Some(rx)) => self.bus.transfer(rx, tx).await?,
            (Some(tx), None) => self.bus.write(tx).await?,
            (None, Some(rx)) => self.bus.read(rx).await?,
            (None, None) => {}
        }
        self.bus.flush().await?;

        if transfer.delay_us > 0 {
            self.delay.delay_us(u32::from(transfer.delay_us)).await;
        }

        Ok(transfer.len)
    }
}
