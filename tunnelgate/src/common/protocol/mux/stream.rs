// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  collections::VecDeque,
  pin::Pin,
  sync::{Arc, Mutex, Weak},
  task::{Context, Poll, Waker},
};

use bytes::{Buf, Bytes};
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  sync::{mpsc::UnboundedSender, oneshot},
};

use super::{
  frame::{Frame, StreamId, MAX_PAYLOAD_LEN},
  lock, Shared,
};
use crate::common::protocol::tunnel::TunnelError;

/// Per-stream state shared between a [MuxStream] and its session's reader task
pub(super) struct StreamShared {
  state: Mutex<StreamState>,
}

struct StreamState {
  received: VecDeque<Bytes>,
  buffered: usize,
  /// Bytes the peer may still send before it runs out of credit
  recv_window: u32,
  /// Bytes consumed locally and not yet returned to the peer as credit
  pending_credit: u32,
  recv_closed: bool,
  send_credit: u32,
  local_closed: bool,
  failure: Option<TunnelError>,
  read_waker: Option<Waker>,
  write_waker: Option<Waker>,
  opened: Option<oneshot::Sender<Result<(), TunnelError>>>,
}

/// What the session should do after handing a stream inbound data
pub(super) enum Delivery {
  Accepted,
  Violation,
}

impl StreamShared {
  pub(super) fn new(
    recv_window: u32,
    send_credit: u32,
    opened: Option<oneshot::Sender<Result<(), TunnelError>>>,
  ) -> Self {
    Self {
      state: Mutex::new(StreamState {
        received: VecDeque::new(),
        buffered: 0,
        recv_window,
        pending_credit: 0,
        recv_closed: false,
        send_credit,
        local_closed: false,
        failure: None,
        read_waker: None,
        write_waker: None,
        opened,
      }),
    }
  }

  pub(super) fn grant_credit(&self, credit: u32) {
    let mut state = lock(&self.state);
    if let Some(opened) = state.opened.take() {
      let _ = opened.send(Ok(()));
    }
    state.send_credit = state.send_credit.saturating_add(credit);
    if let Some(waker) = state.write_waker.take() {
      waker.wake();
    }
  }

  pub(super) fn deliver(&self, payload: Bytes) -> Delivery {
    let mut state = lock(&self.state);
    if state.failure.is_some() || state.recv_closed {
      return Delivery::Accepted;
    }
    let len = payload.len();
    if len > state.recv_window as usize {
      drop(state);
      self.fail(TunnelError::ProtocolViolation("data exceeded granted credit"));
      return Delivery::Violation;
    }
    state.recv_window -= len as u32;
    state.buffered += len;
    state.received.push_back(payload);
    if let Some(waker) = state.read_waker.take() {
      waker.wake();
    }
    Delivery::Accepted
  }

  pub(super) fn finish_receiving(&self) {
    let mut state = lock(&self.state);
    state.recv_closed = true;
    if let Some(waker) = state.read_waker.take() {
      waker.wake();
    }
  }

  pub(super) fn fail(&self, reason: TunnelError) {
    let mut state = lock(&self.state);
    if state.failure.is_none() {
      state.failure = Some(reason.clone());
    }
    if let Some(opened) = state.opened.take() {
      let _ = opened.send(Err(reason));
    }
    if let Some(waker) = state.read_waker.take() {
      waker.wake();
    }
    if let Some(waker) = state.write_waker.take() {
      waker.wake();
    }
  }
}

/// One logical, ordered, bidirectional byte stream carried by a [super::MuxSession]
///
/// Shutting down the write half sends `FIN`; dropping a stream the peer is still
/// writing to sends `RST`.
pub struct MuxStream {
  id: StreamId,
  shared: Arc<StreamShared>,
  outbound: UnboundedSender<Frame>,
  session: Weak<Shared>,
  credit_threshold: u32,
}

impl MuxStream {
  pub(super) fn new(
    id: StreamId,
    shared: Arc<StreamShared>,
    outbound: UnboundedSender<Frame>,
    session: Weak<Shared>,
    buffer_size: u32,
  ) -> Self {
    Self {
      id,
      shared,
      outbound,
      session,
      credit_threshold: std::cmp::max(buffer_size / 4, 1),
    }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub(super) fn acknowledge(&self, window: u32) {
    let _ = self.outbound.send(Frame::Ack {
      stream_id: self.id,
      credit: window,
    });
  }
}

impl std::fmt::Debug for MuxStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MuxStream").field("id", &self.id).finish()
  }
}

impl AsyncRead for MuxStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    let mut state = lock(&this.shared.state);
    let mut read = 0usize;
    while buf.remaining() > 0 {
      let Some(front) = state.received.front_mut() else {
        break;
      };
      let len = std::cmp::min(front.len(), buf.remaining());
      buf.put_slice(&front[..len]);
      front.advance(len);
      if front.is_empty() {
        state.received.pop_front();
      }
      read += len;
    }
    if read > 0 {
      state.buffered -= read;
      state.pending_credit += read as u32;
      if state.failure.is_none()
        && (state.pending_credit >= this.credit_threshold || state.buffered == 0)
      {
        let credit = std::mem::take(&mut state.pending_credit);
        state.recv_window += credit;
        drop(state);
        let _ = this.outbound.send(Frame::Ack {
          stream_id: this.id,
          credit,
        });
      }
      return Poll::Ready(Ok(()));
    }
    if state.recv_closed {
      return Poll::Ready(Ok(()));
    }
    if let Some(failure) = &state.failure {
      return Poll::Ready(Err(failure.clone().into()));
    }
    state.read_waker = Some(cx.waker().clone());
    Poll::Pending
  }
}

impl AsyncWrite for MuxStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    let this = self.get_mut();
    if buf.is_empty() {
      return Poll::Ready(Ok(0));
    }
    let mut state = lock(&this.shared.state);
    if let Some(failure) = &state.failure {
      return Poll::Ready(Err(failure.clone().into()));
    }
    if state.local_closed {
      return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
    }
    if state.send_credit == 0 {
      state.write_waker = Some(cx.waker().clone());
      return Poll::Pending;
    }
    let len = [buf.len(), state.send_credit as usize, MAX_PAYLOAD_LEN]
      .into_iter()
      .min()
      .unwrap_or_default();
    state.send_credit -= len as u32;
    drop(state);
    let frame = Frame::Data {
      stream_id: this.id,
      payload: Bytes::copy_from_slice(&buf[..len]),
    };
    match this.outbound.send(frame) {
      Ok(()) => Poll::Ready(Ok(len)),
      Err(_) => Poll::Ready(Err(TunnelError::ConnectionClosed.into())),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    let state = lock(&self.shared.state);
    match &state.failure {
      Some(failure) => Poll::Ready(Err(failure.clone().into())),
      None => Poll::Ready(Ok(())),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    let mut state = lock(&this.shared.state);
    if !state.local_closed && state.failure.is_none() {
      state.local_closed = true;
      drop(state);
      let _ = this.outbound.send(Frame::Fin { stream_id: this.id });
    }
    Poll::Ready(Ok(()))
  }
}

impl Drop for MuxStream {
  fn drop(&mut self) {
    let mut state = lock(&self.shared.state);
    let farewell = if state.failure.is_some() {
      None
    } else if !state.recv_closed {
      Some(Frame::Rst { stream_id: self.id })
    } else if !state.local_closed {
      Some(Frame::Fin { stream_id: self.id })
    } else {
      None
    };
    state.failure.get_or_insert(TunnelError::LocallyClosed);
    drop(state);
    if let Some(frame) = farewell {
      let _ = self.outbound.send(frame);
    }
    if let Some(session) = self.session.upgrade() {
      session.forget_stream(self.id, &self.shared);
    }
  }
}
