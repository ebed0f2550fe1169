//! Wire types and stream codecs shared across the gateway.
//!
//! This crate intentionally performs no I/O. The codecs consume raw byte
//! chunks and emit complete frames; partial input is buffered internally so
//! callers can feed chunks exactly as they arrive from the socket.

pub mod braced;
pub mod frame;
pub mod openai;
pub mod sse;

pub use braced::BracedJsonParser;
pub use frame::{
    BracedFrameDecoder, FrameDecoder, FrameKind, FramePayload, RawFrame, SseFrameDecoder,
};
pub use sse::{SseEvent, SseParser};
