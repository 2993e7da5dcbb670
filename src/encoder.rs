//! Encoder register protocol over the multiplexed bus.
//!
//! [`EncoderBus`] owns the SPI [`Link`] and the [`ChannelSelector`], and is
//! the only place that touches either during normal operation. Every
//! operation brackets its transfers with a select and a deselect, so at
//! most one encoder is ever addressed.

use embedded_hal::digital::OutputPin;
use heapless::Vec;

use crate::error::Error;
use crate::link::{Link, SpiController};
use crate::registers::{
    CMD_READ_COUNTER, COUNTER_LEN, DEGREES_PER_COUNT, FILL_BYTE, MAX_CHANNELS, PROGRAM_SEQUENCE,
};
use crate::selector::{Channel, ChannelSelector};

/// Programming state of one encoder chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterState {
    #[default]
    Uninitialized,
    /// The mode register sequence has been written.
    Configured,
}

/// Convert a raw position counter to degrees.
///
/// No wraparound handling: the counter is taken as an unsigned count.
pub fn to_angle(counter: u32) -> f64 {
    counter as f64 * DEGREES_PER_COUNT
}

/// Up to six encoder chips sharing one SPI bus behind an address decoder.
pub struct EncoderBus<C, P> {
    link: Link<C>,
    selector: ChannelSelector<P>,
    states: [RegisterState; MAX_CHANNELS],
}

impl<C, P> EncoderBus<C, P>
where
    C: SpiController,
    P: OutputPin,
{
    pub fn new(link: Link<C>, selector: ChannelSelector<P>) -> Self {
        Self {
            link,
            selector,
            states: [RegisterState::Uninitialized; MAX_CHANNELS],
        }
    }

    // -----------------------------------------------------------------------
    // Register protocol
    // -----------------------------------------------------------------------

    /// Put one encoder into quadrature counting mode.
    ///
    /// Writes the mode register select, the quadrature mode byte and the
    /// secondary mode byte as three separate single-byte transfers, each
    /// with its own select/deselect. Safe to repeat.
    ///
    /// # Errors
    /// * [`Error::Config`] if `channel` is outside 1..=6
    /// * [`Error::Spi`], [`Error::ShortTransfer`] or [`Error::Gpio`] on bus
    ///   failure; the channel stays [`RegisterState::Uninitialized`]
    pub async fn program(&mut self, channel: u8) -> Result<(), Error<C::Error, P::Error>> {
        let channel = Channel::new(channel)?;
        for command in PROGRAM_SEQUENCE {
            self.command(channel, command).await?;
        }
        self.states[channel.index()] = RegisterState::Configured;

        #[cfg(feature = "defmt")]
        defmt::debug!("encoder {} set to quadrature", channel.id());

        Ok(())
    }

    /// Read one encoder's 32-bit position counter.
    ///
    /// Sends the read command, then clocks four fill bytes to shift the
    /// counter out (most significant byte first). The channel stays selected
    /// across both transfers.
    ///
    /// # Errors
    /// * [`Error::Config`] if `channel` is outside 1..=6
    /// * [`Error::Spi`], [`Error::ShortTransfer`] or [`Error::Gpio`] on bus
    ///   failure
    pub async fn read(&mut self, channel: u8) -> Result<u32, Error<C::Error, P::Error>> {
        let channel = Channel::new(channel)?;
        self.read_channel(channel).await
    }

    /// Read one encoder and convert to degrees.
    pub async fn read_angle(&mut self, channel: u8) -> Result<f64, Error<C::Error, P::Error>> {
        self.read(channel).await.map(to_angle)
    }

    /// Read channels `1..=count` in ascending order.
    ///
    /// Stops at the first error; no partial results are returned.
    pub async fn read_all(
        &mut self,
        count: usize,
    ) -> Result<Vec<u32, MAX_CHANNELS>, Error<C::Error, P::Error>> {
        let mut counters = Vec::new();
        for channel in Channel::first(count)? {
            let counter = self.read_channel(channel).await?;
            // Channel::first yields at most MAX_CHANNELS items.
            let _ = counters.push(counter);
        }
        Ok(counters)
    }

    pub(crate) async fn read_channel(
        &mut self,
        channel: Channel,
    ) -> Result<u32, Error<C::Error, P::Error>> {
        self.select(channel)?;

        let result = self.fetch_counter().await;
        let released = self.selector.deselect();
        let counter = result?;
        released?;

        Ok(counter)
    }

    async fn fetch_counter(&mut self) -> Result<u32, Error<C::Error, P::Error>> {
        let mut ack = [0u8; 1];
        self.link.exchange(&[CMD_READ_COUNTER], &mut ack).await?;

        let fill = [FILL_BYTE; COUNTER_LEN];
        let mut raw = [0u8; COUNTER_LEN];
        self.link.exchange(&fill, &mut raw).await?;

        Ok(u32::from_be_bytes(raw))
    }

    /// Address `channel`. On a GPIO failure the lines may hold a partial
    /// pattern, so they are driven back to idle before returning the error.
    fn select(&mut self, channel: Channel) -> Result<(), Error<C::Error, P::Error>> {
        if let Err(e) = self.selector.select_channel(channel) {
            let _ = self.selector.deselect();
            return Err(e.into());
        }
        Ok(())
    }

    /// One single-byte instruction, bracketed by select/deselect.
    async fn command(
        &mut self,
        channel: Channel,
        command: u8,
    ) -> Result<(), Error<C::Error, P::Error>> {
        self.select(channel)?;

        let mut rx = [0u8; 1];
        let result = self.link.exchange(&[command], &mut rx).await;
        // Release the bus even when the transfer failed.
        let released = self.selector.deselect();
        result?;
        released?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Park the address lines on the idle pattern.
    pub fn deselect(&mut self) -> Result<(), Error<C::Error, P::Error>> {
        self.selector.deselect()?;
        Ok(())
    }

    /// Programming state of `channel`, or `None` for an invalid id.
    pub fn state(&self, channel: u8) -> Option<RegisterState> {
        Channel::new(channel).ok().map(|c| self.states[c.index()])
    }

    pub fn link(&self) -> &Link<C> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link<C> {
        &mut self.link
    }

    pub fn selector(&self) -> &ChannelSelector<P> {
        &self.selector
    }

    /// Give back the link and the selector.
    pub fn release(self) -> (Link<C>, ChannelSelector<P>) {
        (self.link, self.selector)
    }
}
