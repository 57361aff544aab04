//! Width and capacity constants shared across the engine.

/// Application address, program counter, unique thread id.
pub type Addr = u64;
pub type Pc = u64;
pub type Uid = u64;

/// Dense thread index. 16 bits on the wire (shadow words, fast state);
/// widened to usize for table indexing.
pub type Tid = u32;

/// Per-thread logical time. 40 bits on the wire.
pub type Epoch = u64;

pub const TID_BITS: u32 = 16;
pub const MAX_TID: usize = 1 << TID_BITS;

pub const CLK_BITS: u32 = 40;
pub const MAX_EPOCH: Epoch = (1 << CLK_BITS) - 1;

/// Shadow words kept per application cell. Must be one of 2, 4, 8.
pub const SHADOW_CNT: usize = 8;

/// Bytes of application memory covered by one shadow cell.
pub const SHADOW_CELL: usize = 8;

/// Trace ring geometry: `TRACE_PARTS` parts of `TRACE_PART_SIZE` events.
/// Both powers of two; an epoch maps to slot `epoch % (parts * part_size)`.
pub const TRACE_PARTS: usize = 8;
pub const TRACE_PART_SIZE: usize = 4096;
pub const TRACE_SIZE: usize = TRACE_PARTS * TRACE_PART_SIZE;

/// Dead thread contexts held before their TID becomes reusable.
pub const THREAD_QUARANTINE_SIZE: usize = 100;

/// Shards in the sync-variable table.
pub const SYNC_TAB_PARTS: usize = 1009;

/// TIDs covered by one vector-clock chunk.
pub const CLOCK_CHUNK: usize = 64;

/// Invalid/none thread marker (owner of an unlocked mutex).
pub const INVALID_TID: Tid = Tid::MAX;

const _: () = assert!(SHADOW_CNT == 2 || SHADOW_CNT == 4 || SHADOW_CNT == 8);
const _: () = assert!(TRACE_PARTS.is_power_of_two() && TRACE_PART_SIZE.is_power_of_two());
