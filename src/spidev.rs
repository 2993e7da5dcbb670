//! Linux userspace backend over `/dev/spidevB.C`.
//!
//! Requires the `spidev` feature. Parameters are set with the spidev
//! ioctls and read back from the kernel, so the [`Negotiation`] returned by
//! [`Link::open`] reflects what the driver really accepted.
//!
//! Only the 8-bit mode register is used. Dual, quad and octal flags are
//! never written and never read back, so a request for them shows up as a
//! mode mismatch and transfers run single-line.
//!
//! [`Negotiation`]: crate::Negotiation
//! [`Link::open`]: crate::Link::open

use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use ::spidev::spidevioctl;
use ::spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

use crate::link::{LinkConfig, ModeFlags, SpiController, Transfer};

/// The part of `mode` the 8-bit mode ioctl can carry.
fn kernel_mode(mode: ModeFlags) -> SpiModeFlags {
    let mode = mode - ModeFlags::TX_WIDE - ModeFlags::RX_WIDE;
    SpiModeFlags::from_bits_truncate(mode.bits())
}

fn decode_mode(bits: u8) -> ModeFlags {
    ModeFlags::from_bits_truncate(u32::from(bits))
}

/// A failed spidev call.
#[derive(Debug)]
pub enum SpidevError {
    /// The device node could not be opened.
    Open(io::Error),
    /// A parameter ioctl failed.
    Configure(io::Error),
    /// The transfer ioctl failed.
    Transfer(io::Error),
}

impl fmt::Display for SpidevError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpidevError::Open(e) => write!(f, "can't open device: {}", e),
            SpidevError::Configure(e) => write!(f, "can't configure device: {}", e),
            SpidevError::Transfer(e) => write!(f, "can't send spi message: {}", e),
        }
    }
}

impl std::error::Error for SpidevError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpidevError::Open(e) | SpidevError::Configure(e) | SpidevError::Transfer(e) => Some(e),
        }
    }
}

/// [`SpiController`] backed by a Linux spidev handle.
pub struct SpidevController {
    dev: Spidev,
}

impl SpidevController {
    /// Open a device node such as `/dev/spidev0.0`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SpidevError> {
        let dev = Spidev::open(path).map_err(SpidevError::Open)?;
        Ok(Self { dev })
    }

    /// Open the device named in `config`.
    pub fn open_config(config: &LinkConfig) -> Result<Self, SpidevError> {
        Self::open(config.device.as_str())
    }

    /// Wrap an already opened handle.
    pub fn from_spidev(dev: Spidev) -> Self {
        Self { dev }
    }

    fn configure(&mut self, options: &SpidevOptions) -> Result<(), SpidevError> {
        self.dev.configure(options).map_err(SpidevError::Configure)
    }
}

impl SpiController for SpidevController {
    type Error = SpidevError;

    async fn write_mode(&mut self, mode: ModeFlags) -> Result<(), Self::Error> {
        self.configure(&SpidevOptions::new().mode(kernel_mode(mode)).build())
    }

    async fn read_mode(&mut self) -> Result<ModeFlags, Self::Error> {
        let bits = spidevioctl::get_mode(self.dev.as_raw_fd()).map_err(SpidevError::Configure)?;
        Ok(decode_mode(bits))
    }

    async fn write_bits_per_word(&mut self, bits: u8) -> Result<(), Self::Error> {
        self.configure(&SpidevOptions::new().bits_per_word(bits).build())
    }

    async fn read_bits_per_word(&mut self) -> Result<u8, Self::Error> {
        spidevioctl::get_bits_per_word(self.dev.as_raw_fd()).map_err(SpidevError::Configure)
    }

    async fn write_max_speed_hz(&mut self, speed_hz: u32) -> Result<(), Self::Error> {
        self.configure(&SpidevOptions::new().max_speed_hz(speed_hz).build())
    }

    async fn read_max_speed_hz(&mut self) -> Result<u32, Self::Error> {
        spidevioctl::get_max_speed_hz(self.dev.as_raw_fd()).map_err(SpidevError::Configure)
    }

    async fn transfer(&mut self, transfer: &mut Transfer<'_>) -> Result<usize, Self::Error> {
        let mut xfer = match (transfer.tx, transfer.rx.as_deref_mut()) {
            (Some(tx), Some(rx)) => SpidevTransfer::read_write(tx, rx),
            (Some(tx), None) => SpidevTransfer::write(tx),
            (None, Some(rx)) => SpidevTransfer::read(rx),
            (None, None) => return Ok(0),
        };
        xfer.delay_usecs = transfer.delay_us;
        xfer.speed_hz = transfer.speed_hz;
        xfer.bits_per_word = transfer.bits_per_word;

        self.dev.transfer(&mut xfer).map_err(SpidevError::Transfer)?;

        Ok(transfer.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn mode_bits_match_kernel_flags() {
        assert_eq!(ModeFlags::CPHA.bits(), SpiModeFlags::SPI_CPHA.bits());
        assert_eq!(ModeFlags::CPOL.bits(), SpiModeFlags::SPI_CPOL.bits());
        assert_eq!(ModeFlags::CS_HIGH.bits(), SpiModeFlags::SPI_CS_HIGH.bits());
        assert_eq!(ModeFlags::LSB_FIRST.bits(), SpiModeFlags::SPI_LSB_FIRST.bits());
        assert_eq!(ModeFlags::LOOP.bits(), SpiModeFlags::SPI_LOOP.bits());
        assert_eq!(ModeFlags::NO_CS.bits(), SpiModeFlags::SPI_NO_CS.bits());
    }

    #[test]
    fn mode_register_decoding() {
        assert_eq!(decode_mode(0x00), ModeFlags::empty());
        assert_eq!(decode_mode(0x23), ModeFlags::CPHA | ModeFlags::CPOL | ModeFlags::LOOP);
        assert_eq!(decode_mode(0xFF).bits(), 0xFF);
    }

    #[test]
    fn wide_flags_are_never_written() {
        let requested = ModeFlags::CPOL | ModeFlags::LOOP | ModeFlags::TX_QUAD | ModeFlags::RX_OCTAL;
        let written = kernel_mode(requested);
        assert_eq!(written, SpiModeFlags::SPI_CPOL | SpiModeFlags::SPI_LOOP);
        // What the kernel echoes back differs from the request, so the
        // negotiation reports the dropped widths.
        assert_eq!(decode_mode(written.bits() as u8), ModeFlags::CPOL | ModeFlags::LOOP);
    }

    #[test]
    fn missing_device_fails_to_open() {
        let err = SpidevController::open("/dev/does-not-exist").err().unwrap();
        assert!(matches!(err, SpidevError::Open(_)));
        assert!(err.to_string().starts_with("can't open device"));
    }

    #[test]
    fn config_device_is_the_one_opened() {
        let config = LinkConfig::default().with_device("/dev/spidev-missing.7").unwrap();
        let err = SpidevController::open_config(&config).err().unwrap();
        match err {
            SpidevError::Open(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected error: {}", other),
        }
    }
}
