//! Compile time parameters for the frontend.
//!
//! Sizes are in bytes unless noted otherwise. All registers and all
//! words inside event records are 32 bit.

/// Number of input channels per digitizer board
pub const N_CHANNELS            : usize = 8;

/// Number of channel blocks inside a ZLE event record
pub const N_ZLE_CHANNEL_BLOCKS  : usize = 8;

/// The size of a 32bit unsigned int in byte
pub const SIZEOF_U32            : usize = 4;

/// Number of 32bit words in an event record header
/// (tag/size, channel flags, event counter, trigger time)
pub const EVENT_HEADER_WORDS    : usize = 4;

/// Largest single event record we support
pub const MAX_EVENT_BYTES       : usize = 524288;

/// Ring buffer capacity per board. Must be a power of two and
/// hold at least 30 events plus slack.
pub const RING_CAPACITY_BYTES   : usize = 1 << 24;

/// Readers stop filling a ring above this fraction of its capacity
/// and let the board assert busy to the trigger distributor instead
pub const RING_HIGH_WATER       : f32 = 0.75;

/// Maximum size of data to read in a single block transfer
pub const MAX_BLT_READ_BYTES    : usize = 10000;

/// Bounded wait on a write slot before a reader gives up (ms)
pub const RESERVE_TIMEOUT_MS    : u64 = 100;

/// Bounded wait on the oldest event during a poll cycle (ms)
pub const PEEK_TIMEOUT_MS       : u64 = 100;

/// One hardware clock tick of the 31 bit trigger timestamp is 8 ns
pub const CLOCK_TICK_NS         : u64 = 8;

/// Trigger timestamps are 31 bit, the top bit of word 3 is a flag
pub const TIMESTAMP_MASK        : u32 = 0x7FFFFFFF;

/// Two timestamps further apart than this straddle a rollover
pub const ROLLOVER_HALF         : u32 = 0x40000000;

/// Event records carry 0xA in the top nibble of their first word
pub const RECORD_TAG            : u32 = 0xA;

/// PLL relock time after a soft reset (ms)
pub const PLL_RELOCK_MS         : u64 = 500;

/// Settle time after writing the DAC offsets (ms)
pub const DAC_SETTLE_MS         : u64 = 200;

/// Per-channel deadline for the ADC calibration status bit (s)
pub const ADC_CALIB_DEADLINE_S  : u64 = 20;

/// Hardware event buffer depth. With the almost-full watermark at 0
/// the board asserts busy only once all buffers are used.
pub const BOARD_BUFFER_DEPTH    : u32 = 1024;

/// Board type reported in the board-info register
pub const EXPECTED_BOARD_TYPE   : u32 = 0x0e;

/// Expected AMC (per channel) firmware revision
pub const EXPECTED_AMC_FW_REV   : u32 = 0x14048c02;

/// Expected ROC firmware revision
pub const EXPECTED_ROC_FW_REV   : u32 = 0x1331040c;

/// Pause between connecting consecutive boards (ms)
pub const SLEEP_BETWEEN_CONNECTS_MS : u64 = 50;

/// Default budget for one trigger box record per merged event (ms)
pub const TRIGGER_BOX_BUDGET_MS : u64 = 100;

/// Wait between trigger box receive attempts (ms)
pub const TRIGGER_BOX_RETRY_MS  : u64 = 1;

/// Default deadline for the end-of-run drain
pub const DRAIN_DEADLINE_S      : u64 = 10;

/// Total budget for one merged event. Sub-records beyond this get
/// clamped (ZLE) or degraded to header-only markers (raw).
pub const MERGED_EVENT_BUDGET_BYTES : usize = 32 * 222800;
