//! Wire format: preamble codec, message codec, and the byte-stream
//! frame parser that ties them together.

pub mod frame;
pub mod message;
pub mod preamble;

pub use frame::{FrameCodec, OutFrame, RawFrame};
