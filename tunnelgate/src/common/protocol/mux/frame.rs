// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Wire framing for the stream multiplexer
//!
//! Every frame is a 9 byte header (`type: u8`, `stream_id: u32 BE`, `length: u32 BE`)
//! followed by `length` bytes of payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 9;
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const TYPE_SYN: u8 = 0;
const TYPE_ACK: u8 = 1;
const TYPE_DATA: u8 = 2;
const TYPE_FIN: u8 = 3;
const TYPE_RST: u8 = 4;
const TYPE_PING: u8 = 5;
const TYPE_PONG: u8 = 6;

pub type StreamId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
  /// Opens a stream, granting the acceptor `window` bytes of initial send credit
  Syn { stream_id: StreamId, window: u32 },
  /// Accepts a stream or returns consumed receive credit to the sender
  Ack { stream_id: StreamId, credit: u32 },
  Data { stream_id: StreamId, payload: Bytes },
  /// The sender will write no more data on the stream
  Fin { stream_id: StreamId },
  /// Aborts the stream in both directions
  Rst { stream_id: StreamId },
  Ping { nonce: u64 },
  Pong { nonce: u64 },
}

impl Frame {
  fn type_byte(&self) -> u8 {
    match self {
      Frame::Syn { .. } => TYPE_SYN,
      Frame::Ack { .. } => TYPE_ACK,
      Frame::Data { .. } => TYPE_DATA,
      Frame::Fin { .. } => TYPE_FIN,
      Frame::Rst { .. } => TYPE_RST,
      Frame::Ping { .. } => TYPE_PING,
      Frame::Pong { .. } => TYPE_PONG,
    }
  }

  fn stream_id(&self) -> StreamId {
    match self {
      Frame::Syn { stream_id, .. }
      | Frame::Ack { stream_id, .. }
      | Frame::Data { stream_id, .. }
      | Frame::Fin { stream_id }
      | Frame::Rst { stream_id } => *stream_id,
      Frame::Ping { .. } | Frame::Pong { .. } => 0,
    }
  }

  fn payload_len(&self) -> usize {
    match self {
      Frame::Syn { .. } | Frame::Ack { .. } => 4,
      Frame::Data { payload, .. } => payload.len(),
      Frame::Fin { .. } | Frame::Rst { .. } => 0,
      Frame::Ping { .. } | Frame::Pong { .. } => 8,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
  #[error("Frame I/O failed")]
  Io(
    #[from]
    #[source]
    std::io::Error,
  ),
  #[error("Unknown frame type {0}")]
  UnknownType(u8),
  #[error("Frame payload of {0} bytes exceeds the maximum of {MAX_PAYLOAD_LEN}")]
  Oversized(usize),
  #[error("Frame type {frame_type} carried a {len} byte payload")]
  BadLength { frame_type: u8, len: usize },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
  type Item = Frame;
  type Error = FrameError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if src.len() < HEADER_LEN {
      return Ok(None);
    }
    let frame_type = src[0];
    let stream_id = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
    let len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
    if len > MAX_PAYLOAD_LEN {
      return Err(FrameError::Oversized(len));
    }
    if src.len() < HEADER_LEN + len {
      src.reserve(HEADER_LEN + len - src.len());
      return Ok(None);
    }
    src.advance(HEADER_LEN);
    let mut payload = src.split_to(len);
    let expect_len = |expected: usize| {
      if len == expected {
        Ok(())
      } else {
        Err(FrameError::BadLength { frame_type, len })
      }
    };
    let frame = match frame_type {
      TYPE_SYN => {
        expect_len(4)?;
        Frame::Syn {
          stream_id,
          window: payload.get_u32(),
        }
      }
      TYPE_ACK => {
        expect_len(4)?;
        Frame::Ack {
          stream_id,
          credit: payload.get_u32(),
        }
      }
      TYPE_DATA => Frame::Data {
        stream_id,
        payload: payload.freeze(),
      },
      TYPE_FIN => {
        expect_len(0)?;
        Frame::Fin { stream_id }
      }
      TYPE_RST => {
        expect_len(0)?;
        Frame::Rst { stream_id }
      }
      TYPE_PING => {
        expect_len(8)?;
        Frame::Ping {
          nonce: payload.get_u64(),
        }
      }
      TYPE_PONG => {
        expect_len(8)?;
        Frame::Pong {
          nonce: payload.get_u64(),
        }
      }
      other => return Err(FrameError::UnknownType(other)),
    };
    Ok(Some(frame))
  }
}

impl Encoder<Frame> for FrameCodec {
  type Error = FrameError;

  fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
    let len = frame.payload_len();
    if len > MAX_PAYLOAD_LEN {
      return Err(FrameError::Oversized(len));
    }
    dst.reserve(HEADER_LEN + len);
    dst.put_u8(frame.type_byte());
    dst.put_u32(frame.stream_id());
    dst.put_u32(len as u32);
    match frame {
      Frame::Syn { window: value, .. } | Frame::Ack { credit: value, .. } => dst.put_u32(value),
      Frame::Data { payload, .. } => dst.extend_from_slice(&payload),
      Frame::Fin { .. } | Frame::Rst { .. } => {}
      Frame::Ping { nonce } | Frame::Pong { nonce } => dst.put_u64(nonce),
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use bytes::{BufMut, Bytes, BytesMut};
  use tokio_util::codec::{Decoder, Encoder};

  use super::{Frame, FrameCodec, FrameError, MAX_PAYLOAD_LEN};

  #[test]
  fn partial_frames_wait_for_more_input() {
    let mut codec = FrameCodec;
    let mut encoded = BytesMut::new();
    codec
      .encode(
        Frame::Data {
          stream_id: 7,
          payload: Bytes::from_static(b"hello"),
        },
        &mut encoded,
      )
      .unwrap();
    codec.encode(Frame::Fin { stream_id: 7 }, &mut encoded).unwrap();

    let mut input = BytesMut::new();
    let whole = encoded.freeze();
    input.extend_from_slice(&whole[..6]);
    assert!(codec.decode(&mut input).unwrap().is_none());
    input.extend_from_slice(&whole[6..]);
    assert_eq!(
      codec.decode(&mut input).unwrap(),
      Some(Frame::Data {
        stream_id: 7,
        payload: Bytes::from_static(b"hello"),
      })
    );
    assert_eq!(
      codec.decode(&mut input).unwrap(),
      Some(Frame::Fin { stream_id: 7 })
    );
    assert!(input.is_empty());
  }

  #[test]
  fn oversized_and_unknown_frames_are_rejected() {
    let mut codec = FrameCodec;
    let mut input = BytesMut::new();
    input.put_u8(2);
    input.put_u32(1);
    input.put_u32(MAX_PAYLOAD_LEN as u32 + 1);
    assert!(matches!(
      codec.decode(&mut input),
      Err(FrameError::Oversized(_))
    ));

    let mut input = BytesMut::new();
    input.put_u8(42);
    input.put_u32(1);
    input.put_u32(0);
    assert!(matches!(
      codec.decode(&mut input),
      Err(FrameError::UnknownType(42))
    ));

    let mut input = BytesMut::new();
    input.put_u8(1);
    input.put_u32(1);
    input.put_u32(2);
    input.put_u16(0);
    assert!(matches!(
      codec.decode(&mut input),
      Err(FrameError::BadLength { frame_type: 1, len: 2 })
    ));
  }
}
