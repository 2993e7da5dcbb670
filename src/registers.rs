//! Command bytes, wiring tables and defaults for the encoder board.
//!
//! Each encoder chip is driven by single-byte instructions. The chip that
//! receives them is picked by a 3-to-8 address decoder whose inputs are
//! three GPIO lines (A0, A1, A2). Channel `n` is decoder output `n - 1`.

// ---------------------------------------------------------------------------
// Encoder instructions
// ---------------------------------------------------------------------------

/// Select mode register 0 as the target of the following write.
pub const CMD_WRITE_MODE_REGISTER: u8 = 0x88;

/// Mode byte: x4 quadrature counting.
pub const CMD_QUADRATURE_MODE: u8 = 0x03;

/// Secondary mode byte written after the quadrature mode.
pub const CMD_SECONDARY_MODE: u8 = 0x20;

/// Latch and read the 32-bit position counter.
pub const CMD_READ_COUNTER: u8 = 0x60;

/// Programming sequence, in the order the chip expects it.
pub const PROGRAM_SEQUENCE: [u8; 3] = [
    CMD_WRITE_MODE_REGISTER,
    CMD_QUADRATURE_MODE,
    CMD_SECONDARY_MODE,
];

/// Length of the counter response in bytes (big-endian).
pub const COUNTER_LEN: usize = 4;

/// Filler clocked out while the counter is shifted in.
pub const FILL_BYTE: u8 = 0x00;

// ---------------------------------------------------------------------------
// Angle conversion
// ---------------------------------------------------------------------------

/// Degrees per counter step for the reference encoders (8000 counts/rev).
pub const DEGREES_PER_COUNT: f64 = 0.045;

// ---------------------------------------------------------------------------
// Decoder wiring
// ---------------------------------------------------------------------------

/// Number of channels the decoder board exposes.
pub const MAX_CHANNELS: usize = 6;

/// Number of decoder address lines.
///
/// On the reference Raspberry Pi wiring A0, A1 and A2 are BCM 16, 20 and 21.
pub const ADDRESS_LINES: usize = 3;

/// Reference select patterns for channels 1..=6, bit `i` is line `Ai`.
pub const DEFAULT_ADDRESS_TABLE: [u8; MAX_CHANNELS] =
    [0b000, 0b001, 0b010, 0b011, 0b100, 0b101];

/// All three lines high: decoder output 7, which no encoder is wired to.
pub const DEFAULT_IDLE_PATTERN: u8 = 0b111;

// ---------------------------------------------------------------------------
// Bus and loop defaults
// ---------------------------------------------------------------------------

/// Default spidev node.
pub const DEFAULT_DEVICE: &str = "/dev/spidev0.0";

/// Default maximum bus clock.
pub const DEFAULT_SPEED_HZ: u32 = 500_000;

/// Default word size.
pub const DEFAULT_BITS_PER_WORD: u8 = 8;

/// Default interval between throughput reports.
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 5_000;
