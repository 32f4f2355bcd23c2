//! Byte-stream frame parser.
//!
//! States: `Connect` (initial, waiting for the one-time version byte),
//! `Preamble`, `Data`, `Closed`. Implemented as a `tokio_util::codec`
//! `Decoder`/`Encoder` pair so `tokio_util::codec::Framed` drives the
//! state machine off a single reused `BytesMut` buffer - no per-message
//! allocation, correct handling of partial and multi-message chunks,
//! reentrant from the event loop so transport pause/resume can drive it
//! directly.

use crate::error::ProtocolError;
use crate::protocol::preamble::{self, PREAMBLE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connect,
    Preamble,
    Data { body_size: u32, msg_id: u32, is_compressed: bool },
    Closed,
}

/// A fully-received frame body, still encoded (the connection owns
/// decoding into JSON; the parser only deals in bytes).
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub msg_id: u32,
    pub body: BytesMut,
    pub is_compressed: bool,
}

/// An outbound frame ready to be written to the wire.
pub struct OutFrame {
    pub msg_id: u32,
    pub body: Vec<u8>,
    pub is_compressed: bool,
}

/// The frame codec. One instance per connection; not `Clone` (it is
/// stateful).
pub struct FrameCodec {
    state: State,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self { state: State::Connect }
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
        loop {
            match self.state {
                State::Connect => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let version = src.get_u8();
                    if version != PROTOCOL_VERSION {
                        self.state = State::Closed;
                        return Err(ProtocolError::BadVersion(version));
                    }
                    self.state = State::Preamble;
                }
                State::Preamble => {
                    if src.len() < PREAMBLE_SIZE {
                        return Ok(None);
                    }
                    let mut header = src.split_to(PREAMBLE_SIZE);
                    let (body_size, msg_id, is_compressed) = match preamble::decode(&mut header) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            self.state = State::Closed;
                            return Err(e);
                        }
                    };
                    self.state = State::Data { body_size, msg_id, is_compressed };
                }
                State::Data { body_size, msg_id, is_compressed } => {
                    if (src.len() as u64) < body_size as u64 {
                        return Ok(None);
                    }
                    let body = src.split_to(body_size as usize);
                    self.state = State::Preamble;
                    return Ok(Some(RawFrame { msg_id, body, is_compressed }));
                }
                State::Closed => return Ok(None),
            }
        }
    }
}

impl Encoder<OutFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: OutFrame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        preamble::encode(item.msg_id, item.body.len() as u32, item.is_compressed, dst);
        dst.put_slice(&item.body);
        Ok(())
    }
}
