//! Error types for the encoder multiplexer.
//!
//! Each layer has its own error: [`LinkError`] for the transport and
//! [`SelectError`] for the address lines. Both convert into [`Error`], which
//! the encoder and polling layers return. [`Error::kind`] sorts every variant
//! into configuration, I/O or data-integrity failures.

use core::fmt;

use crate::link::{LinkError, LoopbackMismatch};
use crate::selector::SelectError;

/// Invalid arguments or setup, detected before the bus is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Channel id outside 1..=6.
    InvalidChannel(u8),
    /// Configured channel count outside 1..=6.
    ChannelCount(usize),
    /// Two channels share a select pattern.
    DuplicatePattern { first: u8, second: u8 },
    /// The idle pattern equals a channel's select pattern.
    IdleCollision { channel: u8 },
    /// A pattern uses more than the three address lines.
    PatternTooWide(u8),
    /// Report interval must be positive.
    ZeroInterval,
    /// Transmit and receive buffers differ in length.
    BufferLength { tx: usize, rx: usize },
    /// Self-test transfer size is larger than its buffer.
    TransferSize(usize),
    /// Device identifier does not fit.
    DeviceName { len: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::InvalidChannel(ch) => {
                write!(f, "channel not available (outside of 1-6) selected channel: {}", ch)
            }
            ConfigError::ChannelCount(n) => write!(f, "channel count {} outside of 1-6", n),
            ConfigError::DuplicatePattern { first, second } => {
                write!(f, "channels {} and {} share a select pattern", first, second)
            }
            ConfigError::IdleCollision { channel } => {
                write!(f, "idle pattern selects channel {}", channel)
            }
            ConfigError::PatternTooWide(p) => write!(f, "pattern {:#b} exceeds 3 address lines", p),
            ConfigError::ZeroInterval => write!(f, "report interval must be positive"),
            ConfigError::BufferLength { tx, rx } => {
                write!(f, "tx buffer is {} bytes but rx buffer is {}", tx, rx)
            }
            ConfigError::TransferSize(n) => write!(f, "invalid transfer size {}", n),
            ConfigError::DeviceName { len } => write!(f, "device name too long ({} bytes)", len),
        }
    }
}

/// Broad classes of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// Bad input or setup; nothing was sent.
    Configuration,
    /// Bus, controller or GPIO failure.
    Io,
    /// Loopback data came back altered.
    DataIntegrity,
}

/// Errors returned by the encoder and polling layers.
///
/// `E` is the SPI controller error, `P` the GPIO pin error.
#[derive(Debug)]
pub enum Error<E, P> {
    Config(ConfigError),
    /// SPI controller failure.
    Spi(E),
    /// The controller clocked fewer bytes than requested.
    ShortTransfer { expected: usize, actual: usize },
    /// An address line could not be driven.
    Gpio(P),
    /// Loopback self-test failure.
    Loopback(LoopbackMismatch),
}

impl<E, P> Error<E, P> {
    /// Failure class. Every class ends a run unless the caller chooses
    /// otherwise.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Spi(_) | Error::ShortTransfer { .. } | Error::Gpio(_) => ErrorKind::Io,
            Error::Loopback(_) => ErrorKind::DataIntegrity,
        }
    }
}

impl<E, P> From<ConfigError> for Error<E, P> {
    fn from(error: ConfigError) -> Self {
        Error::Config(error)
    }
}

impl<E, P> From<LinkError<E>> for Error<E, P> {
    fn from(error: LinkError<E>) -> Self {
        match error {
            LinkError::Config(e) => Error::Config(e),
            LinkError::Spi(e) => Error::Spi(e),
            LinkError::ShortTransfer { expected, actual } => {
                Error::ShortTransfer { expected, actual }
            }
        }
    }
}

impl<E, P> From<SelectError<P>> for Error<E, P> {
    fn from(error: SelectError<P>) -> Self {
        match error {
            SelectError::Config(e) => Error::Config(e),
            SelectError::Gpio(e) => Error::Gpio(e),
        }
    }
}

impl<E, P> From<LoopbackMismatch> for Error<E, P> {
    fn from(error: LoopbackMismatch) -> Self {
        Error::Loopback(error)
    }
}

impl<E: fmt::Debug, P: fmt::Debug> fmt::Display for Error<E, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "{}", e),
            Error::Spi(e) => write!(f, "can't send spi message: {:?}", e),
            Error::ShortTransfer { expected, actual } => {
                write!(f, "short SPI transfer: {} of {} bytes", actual, expected)
            }
            Error::Gpio(e) => write!(f, "GPIO error: {:?}", e),
            Error::Loopback(m) => write!(f, "{}", m),
        }
    }
}

#[cfg(feature = "defmt")]
impl<E: defmt::Format, P: defmt::Format> defmt::Format for Error<E, P> {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::Config(e) => defmt::write!(f, "{}", e),
            Error::Spi(e) => defmt::write!(f, "can't send spi message: {}", e),
            Error::ShortTransfer { expected, actual } => {
                defmt::write!(f, "short SPI transfer: {} of {} bytes", actual, expected)
            }
            Error::Gpio(e) => defmt::write!(f, "GPIO error: {}", e),
            Error::Loopback(m) => defmt::write!(f, "{}", m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ByteDiff;

    type TestError = Error<(), ()>;

    #[test]
    fn kinds_follow_the_failure_class() {
        assert_eq!(
            TestError::from(ConfigError::InvalidChannel(7)).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(TestError::Spi(()).kind(), ErrorKind::Io);
        assert_eq!(TestError::Gpio(()).kind(), ErrorKind::Io);
        assert_eq!(
            TestError::ShortTransfer { expected: 4, actual: 0 }.kind(),
            ErrorKind::Io
        );

        let mismatch = LoopbackMismatch {
            diffs: heapless::Vec::from_slice(&[ByteDiff { offset: 0, sent: 1, received: 2 }])
                .unwrap(),
            count: 1,
            len: 1,
        };
        assert_eq!(TestError::from(mismatch).kind(), ErrorKind::DataIntegrity);
    }

    #[test]
    fn layer_errors_convert_without_losing_detail() {
        let from_link: TestError = LinkError::ShortTransfer { expected: 4, actual: 1 }.into();
        assert!(matches!(
            from_link,
            Error::ShortTransfer { expected: 4, actual: 1 }
        ));

        let from_select: TestError = SelectError::Config(ConfigError::InvalidChannel(0)).into();
        assert!(matches!(
            from_select,
            Error::Config(ConfigError::InvalidChannel(0))
        ));
    }
}
