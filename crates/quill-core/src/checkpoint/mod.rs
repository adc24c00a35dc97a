//! Checkpoint codec: streams live values to and from a compact byte buffer
//!
//! Wire layout:
//!
//! ```text
//! header  := version:cint  obj_count:int32  obj_table_offset:int32
//! payload := <object bodies>
//! table   := body_offset[0..obj_count-1] : int32
//! ```
//!
//! Small values (null, bool, numbers) are written inline; everything else
//! is written once as an object body and referenced by id, so shared and
//! cyclic object graphs restore with identity intact. `cint`/`clong` are
//! varints carrying 7 value bits per byte with the high bit signalling
//! continuation.

mod buffer;
mod reader;
mod writer;

pub use buffer::{recycle_buffer, take_buffer, ByteBuf, ByteReader};
pub use reader::CheckpointReader;
pub use writer::CheckpointWriter;

/// Current codec format version
pub const CODEC_VERSION: u32 = 1;

/// Buffers larger than this are dropped between checkpoints instead of
/// being kept in the per-thread cache
pub const SOFT_BUFFER_CEILING: usize = 16 * 1024;

/// Hard upper bound on a single checkpoint image
pub const HARD_BUFFER_CEILING: usize = 128 * 1024 * 1024;

/// Wire tags
pub mod tag {
    /// Inline null
    pub const NULL: u8 = 0;
    /// Inline boolean, payload byte follows
    pub const BOOL: u8 = 1;
    /// Inline 32-bit integer, cint payload
    pub const INT: u8 = 2;
    /// Inline 64-bit integer, clong payload
    pub const LONG: u8 = 3;
    /// Inline float, 8 raw little-endian bytes
    pub const FLOAT: u8 = 4;
    /// Inline decimal, canonical string payload
    pub const DECIMAL: u8 = 5;
    /// Reference to an object body, cint object id follows
    pub const ANY: u8 = 6;

    /// String body
    pub const STRING: u8 = 16;
    /// List body
    pub const LIST: u8 = 17;
    /// Map body
    pub const MAP: u8 = 18;
    /// Typed array body
    pub const ARRAY: u8 = 19;
    /// Instance body
    pub const INSTANCE: u8 = 20;
    /// Function body (name + callback state)
    pub const FUNCTION: u8 = 21;
    /// Iterator body (kind + iterator state)
    pub const ITERATOR: u8 = 22;
    /// String builder body
    pub const STRING_BUILDER: u8 = 23;
    /// Regex matcher body
    pub const MATCHER: u8 = 24;
}
