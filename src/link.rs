//! SPI transport link.
//!
//! [`Link`] owns a bus controller together with the configuration the
//! controller actually accepted. Opening a link writes the requested mode,
//! word size and clock, reads each one back, and returns a [`Negotiation`]
//! describing any divergence. Drivers are allowed to drop mode bits without
//! failing, so the read-back values are what the link runs with.
//!
//! Every [`exchange`](Link::exchange) is a single full-duplex transfer and is
//! counted in the link's [`ByteCounters`].

use bitflags::bitflags;
use heapless::Vec;

use crate::error::ConfigError;
use crate::rate::ByteCounters;
use crate::registers::{DEFAULT_BITS_PER_WORD, DEFAULT_DEVICE, DEFAULT_SPEED_HZ};

/// Maximum stored length of a device identifier.
pub const DEVICE_NAME_LEN: usize = 64;

/// Number of differing bytes kept in a [`LoopbackMismatch`].
pub const MISMATCH_DETAIL: usize = 8;

bitflags! {
    /// SPI mode bits, numbered as the Linux spidev `SPI_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModeFlags: u32 {
        /// Clock phase.
        const CPHA = 0x0001;
        /// Clock polarity.
        const CPOL = 0x0002;
        /// Chip select active high.
        const CS_HIGH = 0x0004;
        /// Least significant bit first.
        const LSB_FIRST = 0x0008;
        /// SI/SO share one line.
        const THREE_WIRE = 0x0010;
        /// Loopback mode.
        const LOOP = 0x0020;
        /// No chip select.
        const NO_CS = 0x0040;
        /// Slave pulls low to pause.
        const READY = 0x0080;
        const TX_DUAL = 0x0100;
        const TX_QUAD = 0x0200;
        const RX_DUAL = 0x0400;
        const RX_QUAD = 0x0800;
        const TX_OCTAL = 0x2000;
        const RX_OCTAL = 0x4000;

        const TX_WIDE = Self::TX_DUAL.bits() | Self::TX_QUAD.bits() | Self::TX_OCTAL.bits();
        const RX_WIDE = Self::RX_DUAL.bits() | Self::RX_QUAD.bits() | Self::RX_OCTAL.bits();
    }
}

impl ModeFlags {
    /// Transmit and receive line counts implied by the width flags.
    ///
    /// When several widths are set the widest one wins.
    pub fn line_widths(self) -> (u8, u8) {
        let tx = if self.contains(Self::TX_OCTAL) {
            8
        } else if self.contains(Self::TX_QUAD) {
            4
        } else if self.contains(Self::TX_DUAL) {
            2
        } else {
            1
        };
        let rx = if self.contains(Self::RX_OCTAL) {
            8
        } else if self.contains(Self::RX_QUAD) {
            4
        } else if self.contains(Self::RX_DUAL) {
            2
        } else {
            1
        };
        (tx, rx)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ModeFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=u32:#x}", self.bits())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Requested bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Bus device identifier, e.g. `/dev/spidev0.0`.
    pub device: heapless::String<DEVICE_NAME_LEN>,
    pub mode: ModeFlags,
    /// Maximum clock speed in Hz.
    pub speed_hz: u32,
    pub bits_per_word: u8,
    /// Delay after each transfer in microseconds.
    pub delay_us: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let mut device = heapless::String::new();
        // DEFAULT_DEVICE is well below DEVICE_NAME_LEN.
        let _ = device.push_str(DEFAULT_DEVICE);
        Self {
            device,
            mode: ModeFlags::empty(),
            speed_hz: DEFAULT_SPEED_HZ,
            bits_per_word: DEFAULT_BITS_PER_WORD,
            delay_us: 0,
        }
    }
}

impl LinkConfig {
    /// Replace the device identifier.
    pub fn with_device(mut self, device: &str) -> Result<Self, ConfigError> {
        self.device.clear();
        self.device
            .push_str(device)
            .map_err(|_| ConfigError::DeviceName { len: device.len() })?;
        Ok(self)
    }

    pub fn with_mode(mut self, mode: ModeFlags) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_speed_hz(mut self, speed_hz: u32) -> Self {
        self.speed_hz = speed_hz;
        self
    }

    pub fn with_bits_per_word(mut self, bits_per_word: u8) -> Self {
        self.bits_per_word = bits_per_word;
        self
    }

    pub fn with_delay_us(mut self, delay_us: u16) -> Self {
        self.delay_us = delay_us;
        self
    }

    /// Apply the implied mode bits.
    ///
    /// In loopback the receive side must run as wide as the transmit side,
    /// so every transmit width flag adds its receive counterpart.
    pub fn normalized(mut self) -> Self {
        if self.mode.contains(ModeFlags::LOOP) {
            if self.mode.contains(ModeFlags::TX_DUAL) {
                self.mode |= ModeFlags::RX_DUAL;
            }
            if self.mode.contains(ModeFlags::TX_QUAD) {
                self.mode |= ModeFlags::RX_QUAD;
            }
            if self.mode.contains(ModeFlags::TX_OCTAL) {
                self.mode |= ModeFlags::RX_OCTAL;
            }
        }
        self
    }

    fn params(&self) -> LinkParams {
        LinkParams {
            mode: self.mode,
            speed_hz: self.speed_hz,
            bits_per_word: self.bits_per_word,
        }
    }
}

/// The negotiable subset of a [`LinkConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkParams {
    pub mode: ModeFlags,
    pub speed_hz: u32,
    pub bits_per_word: u8,
}

/// A parameter the controller did not accept as requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mismatch {
    Mode { requested: ModeFlags, effective: ModeFlags },
    SpeedHz { requested: u32, effective: u32 },
    BitsPerWord { requested: u8, effective: u8 },
}

/// Outcome of opening a link: what was asked for and what the bus runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Negotiation {
    pub requested: LinkParams,
    pub effective: LinkParams,
}

impl Negotiation {
    /// True when every parameter took effect as requested.
    pub fn is_exact(&self) -> bool {
        self.requested == self.effective
    }

    /// Every diverging parameter, in negotiation order.
    pub fn mismatches(&self) -> Vec<Mismatch, 3> {
        let (req, eff) = (self.requested, self.effective);
        let mut out = Vec::new();
        if req.mode != eff.mode {
            let _ = out.push(Mismatch::Mode {
                requested: req.mode,
                effective: eff.mode,
            });
        }
        if req.bits_per_word != eff.bits_per_word {
            let _ = out.push(Mismatch::BitsPerWord {
                requested: req.bits_per_word,
                effective: eff.bits_per_word,
            });
        }
        if req.speed_hz != eff.speed_hz {
            let _ = out.push(Mismatch::SpeedHz {
                requested: req.speed_hz,
                effective: eff.speed_hz,
            });
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Controller seam
// ---------------------------------------------------------------------------

/// One full-duplex transfer as handed to a controller.
///
/// `tx` or `rx` is `None` when that direction carries no meaningful data
/// (a wide transfer outside loopback mode). Controllers must clock exactly
/// `len` words either way.
#[derive(Debug)]
pub struct Transfer<'a> {
    pub tx: Option<&'a [u8]>,
    pub rx: Option<&'a mut [u8]>,
    pub len: usize,
    pub delay_us: u16,
    pub speed_hz: u32,
    pub bits_per_word: u8,
    /// Transmit line count: 1, 2, 4 or 8.
    pub tx_nbits: u8,
    /// Receive line count: 1, 2, 4 or 8.
    pub rx_nbits: u8,
}

/// A bus controller whose parameters can be set and read back.
///
/// Implemented by [`HalController`](crate::HalController) for any
/// `embedded-hal-async` bus and by `SpidevController` on Linux.
#[allow(async_fn_in_trait)]
pub trait SpiController {
    type Error: core::fmt::Debug;

    async fn write_mode(&mut self, mode: ModeFlags) -> Result<(), Self::Error>;
    async fn read_mode(&mut self) -> Result<ModeFlags, Self::Error>;

    async fn write_bits_per_word(&mut self, bits: u8) -> Result<(), Self::Error>;
    async fn read_bits_per_word(&mut self) -> Result<u8, Self::Error>;

    async fn write_max_speed_hz(&mut self, speed_hz: u32) -> Result<(), Self::Error>;
    async fn read_max_speed_hz(&mut self) -> Result<u32, Self::Error>;

    /// Run one transfer and return the number of words clocked.
    async fn transfer(&mut self, transfer: &mut Transfer<'_>) -> Result<usize, Self::Error>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by the transport.
#[derive(Debug)]
pub enum LinkError<E> {
    /// Rejected before the bus was touched.
    Config(ConfigError),
    /// The controller failed a parameter write/read or a transfer.
    Spi(E),
    /// The controller clocked fewer words than requested.
    ShortTransfer { expected: usize, actual: usize },
}

impl<E> From<ConfigError> for LinkError<E> {
    fn from(error: ConfigError) -> Self {
        LinkError::Config(error)
    }
}

impl<E: core::fmt::Debug> core::fmt::Display for LinkError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            LinkError::Config(e) => write!(f, "{}", e),
            LinkError::Spi(e) => write!(f, "SPI error: {:?}", e),
            LinkError::ShortTransfer { expected, actual } => {
                write!(f, "short SPI transfer: {} of {} bytes", actual, expected)
            }
        }
    }
}

#[cfg(feature = "defmt")]
impl<E: defmt::Format> defmt::Format for LinkError<E> {
    fn format(&self, f: defmt::Formatter) {
        match self {
            LinkError::Config(e) => defmt::write!(f, "{}", e),
            LinkError::Spi(e) => defmt::write!(f, "SPI error: {}", e),
            LinkError::ShortTransfer { expected, actual } => {
                defmt::write!(f, "short SPI transfer: {} of {} bytes", actual, expected)
            }
        }
    }
}

/// A byte that came back different from what was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ByteDiff {
    pub offset: usize,
    pub sent: u8,
    pub received: u8,
}

/// Loopback data did not match what was transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoopbackMismatch {
    /// The first differing bytes, in offset order.
    pub diffs: Vec<ByteDiff, MISMATCH_DETAIL>,
    /// Total number of differing bytes.
    pub count: usize,
    /// Transfer length.
    pub len: usize,
}

impl core::fmt::Display for LoopbackMismatch {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "transfer error: {} of {} bytes differ", self.count, self.len)?;
        for d in &self.diffs {
            write!(f, " [{}: {:02X} != {:02X}]", d.offset, d.received, d.sent)?;
        }
        Ok(())
    }
}

/// Byte-compare a loopback exchange.
pub fn compare_loopback(tx: &[u8], rx: &[u8]) -> Result<(), LoopbackMismatch> {
    let mut mismatch = LoopbackMismatch {
        diffs: Vec::new(),
        count: 0,
        len: tx.len(),
    };
    for (offset, (&sent, &received)) in tx.iter().zip(rx).enumerate() {
        if sent != received {
            mismatch.count += 1;
            let _ = mismatch.diffs.push(ByteDiff {
                offset,
                sent,
                received,
            });
        }
    }
    // Length differences count as missing bytes.
    mismatch.count += tx.len().abs_diff(rx.len());

    if mismatch.count == 0 {
        Ok(())
    } else {
        Err(mismatch)
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// An open, negotiated bus.
pub struct Link<C> {
    controller: C,
    config: LinkConfig,
    counters: ByteCounters,
}

impl<C> Link<C>
where
    C: SpiController,
{
    /// Configure `controller` and read back what it accepted.
    ///
    /// Mode, word size and clock are each written and then read back. A
    /// controller that silently drops bits is not an error; the divergence
    /// is returned in the [`Negotiation`] and the link runs with the
    /// effective values.
    ///
    /// # Errors
    /// [`LinkError::Spi`] if any parameter write or read fails.
    pub async fn open(
        mut controller: C,
        requested: LinkConfig,
    ) -> Result<(Self, Negotiation), LinkError<C::Error>> {
        let requested = requested.normalized();

        controller.write_mode(requested.mode).await.map_err(LinkError::Spi)?;
        let mode = controller.read_mode().await.map_err(LinkError::Spi)?;

        controller
            .write_bits_per_word(requested.bits_per_word)
            .await
            .map_err(LinkError::Spi)?;
        let bits_per_word = controller.read_bits_per_word().await.map_err(LinkError::Spi)?;

        controller
            .write_max_speed_hz(requested.speed_hz)
            .await
            .map_err(LinkError::Spi)?;
        let speed_hz = controller.read_max_speed_hz().await.map_err(LinkError::Spi)?;

        let negotiation = Negotiation {
            requested: requested.params(),
            effective: LinkParams {
                mode,
                speed_hz,
                bits_per_word,
            },
        };

        #[cfg(feature = "defmt")]
        {
            for m in negotiation.mismatches() {
                defmt::warn!("device does not support requested setting: {}", m);
            }
            defmt::info!(
                "spi mode: {}, bits per word: {}, max speed: {} Hz ({} kHz)",
                mode,
                bits_per_word,
                speed_hz,
                speed_hz / 1000
            );
        }

        let config = LinkConfig {
            mode,
            speed_hz,
            bits_per_word,
            ..requested
        };

        Ok((
            Self {
                controller,
                config,
                counters: ByteCounters::default(),
            },
            negotiation,
        ))
    }

    /// Run one full-duplex transfer of `tx.len()` bytes.
    ///
    /// Outside loopback, a wide transmit leaves `rx` untouched and a wide
    /// receive sends no data.
    ///
    /// # Errors
    /// * [`LinkError::Config`] if `tx` and `rx` differ in length
    /// * [`LinkError::Spi`] or [`LinkError::ShortTransfer`] on bus failure
    pub async fn exchange(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), LinkError<C::Error>> {
        if tx.len() != rx.len() {
            return Err(ConfigError::BufferLength {
                tx: tx.len(),
                rx: rx.len(),
            }
            .into());
        }
        let len = tx.len();
        let mode = self.config.mode;
        let (tx_nbits, rx_nbits) = mode.line_widths();

        let mut transfer = Transfer {
            tx: Some(tx),
            rx: Some(&mut *rx),
            len,
            delay_us: self.config.delay_us,
            speed_hz: self.config.speed_hz,
            bits_per_word: self.config.bits_per_word,
            tx_nbits,
            rx_nbits,
        };
        if !mode.contains(ModeFlags::LOOP) {
            if mode.intersects(ModeFlags::TX_WIDE) {
                transfer.rx = None;
            } else if mode.intersects(ModeFlags::RX_WIDE) {
                transfer.tx = None;
            }
        }

        let clocked = self
            .controller
            .transfer(&mut transfer)
            .await
            .map_err(LinkError::Spi)?;
        if clocked != len {
            return Err(LinkError::ShortTransfer {
                expected: len,
                actual: clocked,
            });
        }

        self.counters.record(len);
        Ok(())
    }

    /// Check a loopback exchange. Always passes when loopback is off.
    pub fn verify_loopback(&self, tx: &[u8], rx: &[u8]) -> Result<(), LoopbackMismatch> {
        if !self.is_loopback() {
            return Ok(());
        }
        compare_loopback(tx, rx)
    }

    pub fn is_loopback(&self) -> bool {
        self.config.mode.contains(ModeFlags::LOOP)
    }

    /// The configuration in effect after negotiation.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Bytes moved since the link was opened.
    pub fn counters(&self) -> ByteCounters {
        self.counters
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Give back the controller.
    pub fn release(self) -> C {
        self.controller
    }
}
