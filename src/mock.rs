//! Mock bus for unit tests.
//!
//! [`MockBus`] holds shared state for three address lines and an SPI
//! controller. Pins and the controller record into one event log, so tests
//! can check the exact order of line changes and transfers.

use core::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use embedded_hal::digital::{ErrorType, OutputPin, PinState};

use crate::link::{ModeFlags, SpiController, Transfer};
use crate::poller::CancelToken;

/// Something that happened on the mock bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// All three lines were written; carries the resulting pattern.
    Drive(u8),
    /// A transfer ran while `pattern` was on the lines.
    Transfer { pattern: u8, tx: Vec<u8> },
}

#[derive(Debug, Default)]
struct BusState {
    lines: u8,
    line_writes: usize,
    fail_line: Option<usize>,
    fail_once: Option<usize>,
    events: Vec<Event>,
}

/// Shared handle to the mock bus state.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Rc<RefCell<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address lines `[A0, A1, A2]` wired to this bus.
    pub fn pins(&self) -> [MockPin; 3] {
        core::array::from_fn(|index| MockPin {
            index,
            bus: self.clone(),
        })
    }

    /// A controller that logs transfers on this bus.
    pub fn controller(&self) -> MockController {
        MockController {
            bus: self.clone(),
            ..MockController::new()
        }
    }

    pub fn lines(&self) -> u8 {
        self.state.borrow().lines
    }

    pub fn line_writes(&self) -> usize {
        self.state.borrow().line_writes
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    /// Make every later write to line `index` fail.
    pub fn fail_line(&self, index: usize) {
        self.state.borrow_mut().fail_line = Some(index);
    }

    /// Make only the next write to line `index` fail.
    pub fn fail_line_once(&self, index: usize) {
        self.state.borrow_mut().fail_once = Some(index);
    }
}

/// GPIO write failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinFault;

impl embedded_hal::digital::Error for PinFault {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

/// One decoder address line.
#[derive(Debug)]
pub struct MockPin {
    index: usize,
    bus: MockBus,
}

impl ErrorType for MockPin {
    type Error = PinFault;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_state(PinState::Low)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_state(PinState::High)
    }

    fn set_state(&mut self, state: PinState) -> Result<(), Self::Error> {
        let mut bus = self.bus.state.borrow_mut();
        if bus.fail_line == Some(self.index) {
            return Err(PinFault);
        }
        if bus.fail_once == Some(self.index) {
            bus.fail_once = None;
            return Err(PinFault);
        }
        let mask = 1u8 << self.index;
        match state {
            PinState::High => bus.lines |= mask,
            PinState::Low => bus.lines &= !mask,
        }
        bus.line_writes += 1;
        // The selector writes A0, A1, A2 in order; A2 completes a pattern.
        if self.index == 2 {
            let pattern = bus.lines;
            bus.events.push(Event::Drive(pattern));
        }
        Ok(())
    }
}

/// SPI controller failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    Config,
    Transfer,
}

/// What a transfer looked like from the controller's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub tx: Option<Vec<u8>>,
    pub had_rx: bool,
    pub len: usize,
    pub delay_us: u16,
    pub speed_hz: u32,
    pub bits_per_word: u8,
    pub tx_nbits: u8,
    pub rx_nbits: u8,
}

/// Scriptable SPI controller.
///
/// In loopback mode it echoes the transmit buffer. Otherwise it fills the
/// receive buffer from a byte queue (zeros once empty), or with an
/// incrementing big-endian counter for 4-byte transfers.
#[derive(Debug)]
pub struct MockController {
    bus: MockBus,
    mode: ModeFlags,
    supported_modes: ModeFlags,
    bits_per_word: u8,
    speed_hz: u32,
    max_speed_hz: u32,
    fail_config: bool,
    fail_transfer_at: Option<usize>,
    short_by: usize,
    counter: Option<u32>,
    corrupt: Option<(usize, u8)>,
    responses: VecDeque<u8>,
    cancel_after: Option<(usize, &'static CancelToken)>,
    transfer_time: Option<std::time::Duration>,
    transfers: Vec<TransferRecord>,
}

impl MockController {
    pub fn new() -> Self {
        Self {
            bus: MockBus::new(),
            mode: ModeFlags::empty(),
            supported_modes: ModeFlags::all(),
            bits_per_word: 8,
            speed_hz: 0,
            max_speed_hz: u32::MAX,
            fail_config: false,
            fail_transfer_at: None,
            short_by: 0,
            counter: None,
            corrupt: None,
            responses: VecDeque::new(),
            cancel_after: None,
            transfer_time: None,
            transfers: Vec::new(),
        }
    }

    /// Silently drop mode bits outside `modes`.
    pub fn with_supported_modes(mut self, modes: ModeFlags) -> Self {
        self.supported_modes = modes;
        self
    }

    /// Clamp the clock to `max`.
    pub fn with_max_speed_hz(mut self, max: u32) -> Self {
        self.max_speed_hz = max;
        self
    }

    pub fn with_response(mut self, bytes: &[u8]) -> Self {
        self.responses.extend(bytes.iter().copied());
        self
    }

    /// Answer every 4-byte transfer with the next counter value.
    pub fn with_counter_from(mut self, start: u32) -> Self {
        self.counter = Some(start);
        self
    }

    /// XOR `mask` into receive byte `offset` of every transfer.
    pub fn corrupting(mut self, offset: usize, mask: u8) -> Self {
        self.corrupt = Some((offset, mask));
        self
    }

    pub fn failing_config(mut self) -> Self {
        self.fail_config = true;
        self
    }

    /// Fail the transfer with zero-based sequence number `n`.
    pub fn failing_transfer(mut self, n: usize) -> Self {
        self.fail_transfer_at = Some(n);
        self
    }

    /// Report `n` fewer words than requested.
    pub fn short_by(mut self, n: usize) -> Self {
        self.short_by = n;
        self
    }

    /// Cancel `token` once `n` transfers have completed.
    pub fn cancelling_after(mut self, n: usize, token: &'static CancelToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    /// Block for `time` on every successful transfer.
    pub fn taking(mut self, time: std::time::Duration) -> Self {
        self.transfer_time = Some(time);
        self
    }

    pub fn transfers(&self) -> &[TransferRecord] {
        &self.transfers
    }
}

impl SpiController for MockController {
    type Error = MockError;

    async fn write_mode(&mut self, mode: ModeFlags) -> Result<(), Self::Error> {
        if self.fail_config {
            return Err(MockError::Config);
        }
        self.mode = mode & self.supported_modes;
        Ok(())
    }

    async fn read_mode(&mut self) -> Result<ModeFlags, Self::Error> {
        Ok(self.mode)
    }

    async fn write_bits_per_word(&mut self, bits: u8) -> Result<(), Self::Error> {
        self.bits_per_word = bits;
        Ok(())
    }

    async fn read_bits_per_word(&mut self) -> Result<u8, Self::Error> {
        Ok(self.bits_per_word)
    }

    async fn write_max_speed_hz(&mut self, speed_hz: u32) -> Result<(), Self::Error> {
        self.speed_hz = speed_hz.min(self.max_speed_hz);
        Ok(())
    }

    async fn read_max_speed_hz(&mut self) -> Result<u32, Self::Error> {
        Ok(self.speed_hz)
    }

    async fn transfer(&mut self, transfer: &mut Transfer<'_>) -> Result<usize, Self::Error> {
        if self.fail_transfer_at == Some(self.transfers.len()) {
            self.transfers.push(TransferRecord {
                tx: None,
                had_rx: false,
                len: transfer.len,
                delay_us: transfer.delay_us,
                speed_hz: transfer.speed_hz,
                bits_per_word: transfer.bits_per_word,
                tx_nbits: transfer.tx_nbits,
                rx_nbits: transfer.rx_nbits,
            });
            return Err(MockError::Transfer);
        }

        if let Some(time) = self.transfer_time {
            std::thread::sleep(time);
        }

        let tx = transfer.tx.map(|t| t.to_vec());
        {
            let mut bus = self.bus.state.borrow_mut();
            let pattern = bus.lines;
            bus.events.push(Event::Transfer {
                pattern,
                tx: tx.clone().unwrap_or_default(),
            });
        }

        let had_rx = transfer.rx.is_some();
        if let Some(rx) = transfer.rx.as_deref_mut() {
            if self.mode.contains(ModeFlags::LOOP) {
                if let Some(t) = transfer.tx {
                    rx.copy_from_slice(t);
                }
            } else if let (Some(counter), 4) = (self.counter.as_mut(), rx.len()) {
                rx.copy_from_slice(&counter.to_be_bytes());
                *counter = counter.wrapping_add(1);
            } else {
                for byte in rx.iter_mut() {
                    *byte = self.responses.pop_front().unwrap_or(0);
                }
            }
            if let Some((offset, mask)) = self.corrupt {
                if let Some(byte) = rx.get_mut(offset) {
                    *byte ^= mask;
                }
            }
        }

        self.transfers.push(TransferRecord {
            tx,
            had_rx,
            len: transfer.len,
            delay_us: transfer.delay_us,
            speed_hz: transfer.speed_hz,
            bits_per_word: transfer.bits_per_word,
            tx_nbits: transfer.tx_nbits,
            rx_nbits: transfer.rx_nbits,
        });
        if let Some((n, token)) = self.cancel_after {
            if self.transfers.len() == n {
                token.cancel();
            }
        }

        Ok(transfer.len.saturating_sub(self.short_by))
    }
}
