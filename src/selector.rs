//! Chip-select multiplexing through a 3-to-8 address decoder.
//!
//! Three GPIO lines drive the decoder's address inputs. Each encoder channel
//! is one decoder output; an eighth, unwired output serves as "nothing
//! selected". [`ChannelSelector`] guarantees that the lines always carry
//! either exactly one channel's pattern or the idle pattern.

use embedded_hal::digital::{OutputPin, PinState};

use crate::error::ConfigError;
use crate::registers::{ADDRESS_LINES, DEFAULT_ADDRESS_TABLE, DEFAULT_IDLE_PATTERN, MAX_CHANNELS};

/// A validated channel id in 1..=6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Channel(u8);

impl Channel {
    /// # Errors
    /// [`ConfigError::InvalidChannel`] if `id` is outside 1..=6.
    pub fn new(id: u8) -> Result<Self, ConfigError> {
        if (1..=MAX_CHANNELS as u8).contains(&id) {
            Ok(Self(id))
        } else {
            Err(ConfigError::InvalidChannel(id))
        }
    }

    /// The 1-based channel id.
    pub fn id(self) -> u8 {
        self.0
    }

    /// Zero-based slot index for result storage.
    pub fn index(self) -> usize {
        self.0 as usize - 1
    }

    /// Channels `1..=count`, ascending.
    ///
    /// # Errors
    /// [`ConfigError::ChannelCount`] if `count` is outside 1..=6.
    pub fn first(count: usize) -> Result<impl Iterator<Item = Channel>, ConfigError> {
        if !(1..=MAX_CHANNELS).contains(&count) {
            return Err(ConfigError::ChannelCount(count));
        }
        Ok((1..=count as u8).map(Channel))
    }
}

/// Select patterns for the six channels plus the idle pattern.
///
/// Bit `i` of a pattern is the level of address line `Ai`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressTable {
    entries: [u8; MAX_CHANNELS],
    idle: u8,
}

impl AddressTable {
    /// Build a table for a specific wiring.
    ///
    /// The decoder has no "off" output among the six channels, so the table
    /// is only usable if the idle pattern differs from every channel pattern
    /// and no two channels share one.
    ///
    /// # Errors
    /// * [`ConfigError::PatternTooWide`] if a pattern needs more than 3 lines
    /// * [`ConfigError::DuplicatePattern`] if two channels collide
    /// * [`ConfigError::IdleCollision`] if idle equals a channel pattern
    pub fn new(entries: [u8; MAX_CHANNELS], idle: u8) -> Result<Self, ConfigError> {
        let limit = 1u8 << ADDRESS_LINES;
        if idle >= limit {
            return Err(ConfigError::PatternTooWide(idle));
        }
        for (i, &pattern) in entries.iter().enumerate() {
            if pattern >= limit {
                return Err(ConfigError::PatternTooWide(pattern));
            }
            if pattern == idle {
                return Err(ConfigError::IdleCollision {
                    channel: i as u8 + 1,
                });
            }
            if let Some(j) = entries[..i].iter().position(|&p| p == pattern) {
                return Err(ConfigError::DuplicatePattern {
                    first: j as u8 + 1,
                    second: i as u8 + 1,
                });
            }
        }
        Ok(Self { entries, idle })
    }

    pub fn pattern(&self, channel: Channel) -> u8 {
        self.entries[channel.index()]
    }

    pub fn idle(&self) -> u8 {
        self.idle
    }

    /// The channel a pattern selects, if any.
    pub fn channel_for(&self, pattern: u8) -> Option<Channel> {
        self.entries
            .iter()
            .position(|&p| p == pattern)
            .map(|i| Channel(i as u8 + 1))
    }
}

impl Default for AddressTable {
    /// Reference board wiring: channel `n` is decoder output `n - 1`, idle is 7.
    fn default() -> Self {
        Self {
            entries: DEFAULT_ADDRESS_TABLE,
            idle: DEFAULT_IDLE_PATTERN,
        }
    }
}

/// Errors raised while driving the address lines.
#[derive(Debug)]
pub enum SelectError<P> {
    Config(ConfigError),
    Gpio(P),
}

impl<P> From<ConfigError> for SelectError<P> {
    fn from(error: ConfigError) -> Self {
        SelectError::Config(error)
    }
}

impl<P: core::fmt::Debug> core::fmt::Display for SelectError<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            SelectError::Config(e) => write!(f, "{}", e),
            SelectError::Gpio(e) => write!(f, "GPIO error: {:?}", e),
        }
    }
}

#[cfg(feature = "defmt")]
impl<P: defmt::Format> defmt::Format for SelectError<P> {
    fn format(&self, f: defmt::Formatter) {
        match self {
            SelectError::Config(e) => defmt::write!(f, "{}", e),
            SelectError::Gpio(e) => defmt::write!(f, "GPIO error: {}", e),
        }
    }
}

/// Drives the decoder address lines.
pub struct ChannelSelector<P> {
    lines: [P; ADDRESS_LINES],
    table: AddressTable,
    current: Option<u8>,
}

impl<P> ChannelSelector<P>
where
    P: OutputPin,
{
    /// Take the three address lines (`[A0, A1, A2]`) and park them idle.
    ///
    /// # Errors
    /// [`SelectError::Gpio`] if a line cannot be driven.
    pub fn new(
        lines: [P; ADDRESS_LINES],
        table: AddressTable,
    ) -> Result<Self, SelectError<P::Error>> {
        let mut selector = Self {
            lines,
            table,
            current: None,
        };
        selector.deselect()?;
        Ok(selector)
    }

    /// Drive the lines to `channel`'s pattern.
    ///
    /// # Errors
    /// * [`SelectError::Config`] if `channel` is outside 1..=6; the lines
    ///   are left as they were
    /// * [`SelectError::Gpio`] if a line cannot be driven
    pub fn select(&mut self, channel: u8) -> Result<(), SelectError<P::Error>> {
        let channel = Channel::new(channel)?;
        self.select_channel(channel)
    }

    pub fn select_channel(&mut self, channel: Channel) -> Result<(), SelectError<P::Error>> {
        self.drive(self.table.pattern(channel))
    }

    /// Drive the idle pattern.
    pub fn deselect(&mut self) -> Result<(), SelectError<P::Error>> {
        self.drive(self.table.idle())
    }

    /// Pattern currently on the lines, or `None` after a failed write left
    /// them in an unknown state.
    pub fn current(&self) -> Option<u8> {
        self.current
    }

    /// The channel currently selected, if any.
    pub fn selected(&self) -> Option<Channel> {
        self.current.and_then(|p| self.table.channel_for(p))
    }

    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    /// Give back the address lines.
    pub fn release(self) -> [P; ADDRESS_LINES] {
        self.lines
    }

    fn drive(&mut self, pattern: u8) -> Result<(), SelectError<P::Error>> {
        self.current = None;
        for (bit, line) in self.lines.iter_mut().enumerate() {
            let level = PinState::from(pattern & (1 << bit) != 0);
            line.set_state(level).map_err(SelectError::Gpio)?;
        }
        self.current = Some(pattern);
        Ok(())
    }
}
