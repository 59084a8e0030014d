// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Stream multiplexing over a single ordered, reliable byte connection
//!
//! A [MuxSession] owns one physical connection and runs two tasks over it: a
//! reader that demultiplexes inbound frames into per-stream buffers, and a
//! writer that serializes outbound frames and emits keep-alive pings. Each
//! [MuxStream] has its own receive buffer bounded by the credit it grants its
//! peer, so a stream nobody reads from stalls only its own sender.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use futures::{
  future::{BoxFuture, FutureExt},
  SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
  },
};
use tokio_util::{
  codec::{FramedRead, FramedWrite},
  sync::CancellationToken,
};
use tracing_futures::Instrument;

use self::{
  frame::{Frame, FrameCodec, FrameError, StreamId},
  stream::{Delivery, StreamShared},
};
use crate::{
  common::protocol::tunnel::{
    Sided, Tunnel, TunnelDownlink, TunnelError, TunnelMonitoring, TunnelSide, TunnelUplink,
  },
  util::tunnel_stream::WrappedStream,
};

pub mod frame;
mod stream;

pub use self::stream::MuxStream;

/// Upgrade protocol token naming this framing in registration handshakes
pub const UPGRADE_PROTOCOL: &str = "tunnelgate-mux";

const CLOSE_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
  /// Receive credit granted to the peer per stream; bounds each stream's buffer
  pub stream_buffer_size: u32,
  #[serde(with = "crate::util::duration_ms")]
  pub keep_alive_interval: Duration,
  /// Read deadline; the session fails if nothing arrives for this long
  #[serde(with = "crate::util::duration_ms")]
  pub keep_alive_timeout: Duration,
  /// How long `open_link` waits for the peer to accept a stream
  #[serde(with = "crate::util::duration_ms")]
  pub stream_accept_deadline: Duration,
  /// Remote-opened streams waiting for `accept_link`; further streams are reset
  pub accept_queue: usize,
}

impl Default for MuxConfig {
  fn default() -> Self {
    Self {
      stream_buffer_size: 64 * 1024,
      keep_alive_interval: Duration::from_secs(15),
      keep_alive_timeout: Duration::from_secs(45),
      stream_accept_deadline: Duration::from_secs(30),
      accept_queue: 256,
    }
  }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StreamTable {
  streams: HashMap<StreamId, Arc<StreamShared>>,
  next_id: StreamId,
}

pub(crate) struct Shared {
  side: TunnelSide,
  config: MuxConfig,
  outbound: mpsc::UnboundedSender<Frame>,
  table: Mutex<StreamTable>,
  accept_tx: mpsc::Sender<MuxStream>,
  accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
  closed: CancellationToken,
  close_reason: Mutex<Option<TunnelError>>,
  writer_finished: CancellationToken,
}

fn first_local_id(side: TunnelSide) -> StreamId {
  match side {
    TunnelSide::Listen => 2,
    TunnelSide::Connect => 1,
  }
}

impl Shared {
  fn reason(&self) -> TunnelError {
    lock(&self.close_reason)
      .clone()
      .unwrap_or(TunnelError::ConnectionClosed)
  }

  fn is_locally_allocated(&self, id: StreamId) -> bool {
    id % 2 == first_local_id(self.side) % 2
  }

  /// Fails the session and every stream on it; only the first reason is kept
  fn abort(&self, reason: TunnelError) {
    {
      let mut close_reason = lock(&self.close_reason);
      if close_reason.is_some() {
        return;
      }
      *close_reason = Some(reason.clone());
    }
    self.closed.cancel();
    let streams = lock(&self.table)
      .streams
      .values()
      .cloned()
      .collect::<Vec<_>>();
    tracing::debug!(reason = %reason, streams = streams.len(), "Multiplexed session closing");
    for stream in streams {
      stream.fail(reason.clone());
    }
  }

  fn forget_stream(&self, id: StreamId, shared: &Arc<StreamShared>) {
    let mut table = lock(&self.table);
    if matches!(table.streams.get(&id), Some(existing) if Arc::ptr_eq(existing, shared)) {
      table.streams.remove(&id);
    }
  }

  fn stream(&self, id: StreamId) -> Option<Arc<StreamShared>> {
    lock(&self.table).streams.get(&id).cloned()
  }

  fn send(&self, frame: Frame) {
    let _ = self.outbound.send(frame);
  }

  fn handle_frame(self: &Arc<Self>, frame: Frame) {
    match frame {
      Frame::Syn { stream_id, window } => self.handle_syn(stream_id, window),
      Frame::Ack { stream_id, credit } => {
        if let Some(stream) = self.stream(stream_id) {
          stream.grant_credit(credit);
        }
      }
      Frame::Data { stream_id, payload } => match self.stream(stream_id) {
        Some(stream) => {
          if let Delivery::Violation = stream.deliver(payload) {
            tracing::warn!(stream_id, "Peer exceeded stream credit; resetting stream");
            self.send(Frame::Rst { stream_id });
          }
        }
        None => tracing::trace!(stream_id, "Data for unknown stream dropped"),
      },
      Frame::Fin { stream_id } => {
        if let Some(stream) = self.stream(stream_id) {
          stream.finish_receiving();
        }
      }
      Frame::Rst { stream_id } => {
        if let Some(stream) = self.stream(stream_id) {
          stream.fail(TunnelError::StreamReset);
        }
      }
      Frame::Ping { nonce } => self.send(Frame::Pong { nonce }),
      Frame::Pong { nonce } => tracing::trace!(nonce, "Keep-alive acknowledged"),
    }
  }

  fn handle_syn(self: &Arc<Self>, stream_id: StreamId, window: u32) {
    if stream_id == 0 || self.is_locally_allocated(stream_id) {
      tracing::warn!(stream_id, "Peer opened a stream with an ID from our range");
      self.send(Frame::Rst { stream_id });
      return;
    }
    let shared = {
      let mut table = lock(&self.table);
      if table.streams.contains_key(&stream_id) {
        tracing::warn!(stream_id, "Peer reopened a stream that is still live");
        return;
      }
      let shared = Arc::new(StreamShared::new(
        self.config.stream_buffer_size,
        window,
        None,
      ));
      table.streams.insert(stream_id, shared.clone());
      shared
    };
    let stream = MuxStream::new(
      stream_id,
      shared,
      self.outbound.clone(),
      Arc::downgrade(self),
      self.config.stream_buffer_size,
    );
    match self.accept_tx.try_send(stream) {
      Ok(()) => {}
      Err(TrySendError::Full(stream)) => {
        tracing::warn!(stream_id, "Accept queue full; resetting stream");
        drop(stream);
      }
      Err(TrySendError::Closed(stream)) => drop(stream),
    }
  }

  fn open(self: &Arc<Self>) -> BoxFuture<'static, Result<WrappedStream, TunnelError>> {
    if self.closed.is_cancelled() {
      return futures::future::ready(Err(self.reason())).boxed();
    }
    let (opened_tx, opened_rx) = oneshot::channel();
    let shared = Arc::new(StreamShared::new(
      self.config.stream_buffer_size,
      0,
      Some(opened_tx),
    ));
    let stream_id = {
      let mut table = lock(&self.table);
      let mut candidate = table.next_id;
      while table.streams.contains_key(&candidate) {
        candidate = next_stream_id(self.side, candidate);
      }
      table.next_id = next_stream_id(self.side, candidate);
      table.streams.insert(candidate, shared.clone());
      candidate
    };
    let stream = MuxStream::new(
      stream_id,
      shared,
      self.outbound.clone(),
      Arc::downgrade(self),
      self.config.stream_buffer_size,
    );
    self.send(Frame::Syn {
      stream_id,
      window: self.config.stream_buffer_size,
    });
    let deadline = self.config.stream_accept_deadline;
    let this = self.clone();
    async move {
      tokio::select! {
        opened = tokio::time::timeout(deadline, opened_rx) => match opened {
          Ok(Ok(Ok(()))) => Ok(Box::new(stream) as WrappedStream),
          Ok(Ok(Err(e))) => Err(e),
          Ok(Err(_)) => Err(this.reason()),
          Err(_) => {
            tracing::debug!(stream_id, "Peer did not accept stream before the deadline");
            Err(TunnelError::AcceptTimeout)
          }
        },
        _ = this.closed.cancelled() => Err(this.reason()),
      }
    }
    .boxed()
  }

  fn accept(self: &Arc<Self>) -> BoxFuture<'static, Result<WrappedStream, TunnelError>> {
    let this = self.clone();
    async move {
      let mut incoming = this.accept_rx.lock().await;
      tokio::select! {
        biased;
        _ = this.closed.cancelled() => Err(this.reason()),
        stream = incoming.recv() => match stream {
          Some(stream) => {
            stream.acknowledge(this.config.stream_buffer_size);
            Ok(Box::new(stream) as WrappedStream)
          }
          None => Err(this.reason()),
        },
      }
    }
    .boxed()
  }
}

fn next_stream_id(side: TunnelSide, current: StreamId) -> StreamId {
  match current.checked_add(2) {
    Some(next) => next,
    None => first_local_id(side),
  }
}

/// A [Tunnel] multiplexing logical streams over one physical connection
#[derive(Clone)]
pub struct MuxSession {
  shared: Arc<Shared>,
}

impl MuxSession {
  /// Takes ownership of `io` and starts the session's reader and writer tasks
  pub fn new<T>(io: T, side: TunnelSide, config: MuxConfig) -> Self
  where
    T: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (accept_tx, accept_rx) = mpsc::channel(std::cmp::max(config.accept_queue, 1));
    let shared = Arc::new(Shared {
      side,
      config,
      outbound: outbound_tx,
      table: Mutex::new(StreamTable {
        streams: HashMap::new(),
        next_id: first_local_id(side),
      }),
      accept_tx,
      accept_rx: tokio::sync::Mutex::new(accept_rx),
      closed: CancellationToken::new(),
      close_reason: Mutex::new(None),
      writer_finished: CancellationToken::new(),
    });
    let (reader, writer) = tokio::io::split(io);
    let span = tracing::span!(tracing::Level::DEBUG, "mux_session", side = ?side);
    tokio::spawn(read_frames(shared.clone(), reader).instrument(span.clone()));
    tokio::spawn(write_frames(shared.clone(), writer, outbound_rx).instrument(span));
    Self { shared }
  }

  /// Number of logical streams currently tracked, including unaccepted ones
  pub fn stream_count(&self) -> usize {
    lock(&self.shared.table).streams.len()
  }

  pub fn config(&self) -> &MuxConfig {
    &self.shared.config
  }
}

impl std::fmt::Debug for MuxSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MuxSession")
      .field("side", &self.shared.side)
      .field("closed", &self.shared.closed.is_cancelled())
      .field("streams", &self.stream_count())
      .finish()
  }
}

async fn read_frames<R>(shared: Arc<Shared>, reader: R)
where
  R: AsyncRead + Send + Unpin + 'static,
{
  let mut frames = FramedRead::new(reader, FrameCodec);
  let timeout = shared.config.keep_alive_timeout;
  loop {
    let next = tokio::select! {
      _ = shared.closed.cancelled() => return,
      next = tokio::time::timeout(timeout, frames.next()) => next,
    };
    match next {
      Ok(Some(Ok(frame))) => shared.handle_frame(frame),
      Ok(Some(Err(FrameError::Io(e)))) => {
        tracing::debug!(error = ?e, "Physical connection read failed");
        shared.abort(TunnelError::TransportError(e.to_string().into()));
        return;
      }
      Ok(Some(Err(e))) => {
        tracing::warn!(error = %e, "Peer sent an invalid frame");
        shared.abort(TunnelError::ProtocolViolation("invalid frame"));
        return;
      }
      Ok(None) => {
        shared.abort(TunnelError::ConnectionClosed);
        return;
      }
      Err(_) => {
        tracing::info!(?timeout, "No traffic from peer within keep-alive timeout");
        shared.abort(TunnelError::TimedOut);
        return;
      }
    }
  }
}

async fn write_frames<W>(
  shared: Arc<Shared>,
  writer: W,
  mut outbound: mpsc::UnboundedReceiver<Frame>,
) where
  W: AsyncWrite + Send + Unpin + 'static,
{
  let mut frames = FramedWrite::new(writer, FrameCodec);
  let result: Result<(), FrameError> = async {
    let interval = shared.config.keep_alive_interval;
    let mut keep_alive = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut nonce = 0u64;
    loop {
      tokio::select! {
        biased;
        _ = shared.closed.cancelled() => return Ok(()),
        frame = outbound.recv() => {
          let Some(frame) = frame else { return Ok(()) };
          frames.feed(frame).await?;
          while let Ok(frame) = outbound.try_recv() {
            frames.feed(frame).await?;
          }
          frames.flush().await?;
        }
        _ = keep_alive.tick() => {
          nonce = nonce.wrapping_add(1);
          frames.send(Frame::Ping { nonce }).await?;
        }
      }
    }
  }
  .await;
  match result {
    Ok(()) => {
      // Best effort delivery of frames queued before close, such as FIN
      let drain = async {
        while let Ok(frame) = outbound.try_recv() {
          frames.feed(frame).await?;
        }
        frames.close().await
      };
      if let Err(e) = tokio::time::timeout(CLOSE_FLUSH_DEADLINE, drain)
        .await
        .unwrap_or(Ok(()))
      {
        tracing::trace!(error = %e, "Final flush of physical connection failed");
      }
    }
    Err(e) => {
      tracing::debug!(error = %e, "Physical connection write failed");
      shared.abort(TunnelError::TransportError(e.to_string().into()));
    }
  }
  shared.writer_finished.cancel();
}

impl Sided for MuxSession {
  fn side(&self) -> TunnelSide {
    self.shared.side
  }
}

impl TunnelUplink for MuxSession {
  fn open_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>> {
    self.shared.open()
  }
}

impl TunnelDownlink for MuxSession {
  fn accept_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>> {
    self.shared.accept()
  }
}

impl TunnelMonitoring for MuxSession {
  fn is_closed(&self) -> bool {
    self.shared.closed.is_cancelled()
  }

  fn on_closed(&self) -> BoxFuture<'static, TunnelError> {
    let shared = self.shared.clone();
    async move {
      shared.closed.cancelled().await;
      shared.reason()
    }
    .boxed()
  }
}

impl Tunnel for MuxSession {
  fn close(&self) -> BoxFuture<'static, ()> {
    self.shared.abort(TunnelError::LocallyClosed);
    self.shared.writer_finished.clone().cancelled_owned().boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{MuxConfig, MuxSession};
  use crate::common::protocol::tunnel::{
    TunnelDownlink, TunnelError, TunnelMonitoring, TunnelSide, TunnelUplink, Tunnel,
  };

  fn pair(config: MuxConfig) -> (MuxSession, MuxSession) {
    let (relay_io, worker_io) = tokio::io::duplex(256 * 1024);
    (
      MuxSession::new(relay_io, TunnelSide::Listen, config.clone()),
      MuxSession::new(worker_io, TunnelSide::Connect, config),
    )
  }

  fn small_buffers() -> MuxConfig {
    MuxConfig {
      stream_buffer_size: 1024,
      ..Default::default()
    }
  }

  async fn round_trip(payload_len: usize) {
    let (relay, worker) = pair(small_buffers());
    let payload = (0..payload_len).map(|i| (i % 251) as u8).collect::<Vec<_>>();

    let echo = tokio::spawn(async move {
      let mut stream = worker.accept_link().await.unwrap();
      let mut received = Vec::new();
      stream.read_to_end(&mut received).await.unwrap();
      stream.write_all(&received).await.unwrap();
      stream.shutdown().await.unwrap();
      // Keep the session alive until the relay has read the echo
      let mut rest = Vec::new();
      let _ = stream.read_to_end(&mut rest).await;
      worker
    });

    let mut stream = relay.open_link().await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(&mut stream);
    let send = async {
      writer.write_all(&payload).await.unwrap();
      writer.shutdown().await.unwrap();
    };
    let receive = async {
      let mut echoed = Vec::new();
      reader.read_to_end(&mut echoed).await.unwrap();
      echoed
    };
    let ((), echoed) = tokio::time::timeout(Duration::from_secs(10), async {
      futures::join!(send, receive)
    })
    .await
    .expect("round trip timed out");
    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload, "echoed bytes differ from those sent");
    drop(stream);
    echo.await.unwrap();
  }

  #[tokio::test]
  async fn round_trip_smaller_than_buffer() {
    round_trip(100).await;
  }

  #[tokio::test]
  async fn round_trip_larger_than_buffer() {
    round_trip(300 * 1024).await;
  }

  #[tokio::test]
  async fn slow_stream_does_not_block_siblings() {
    let (relay, worker) = pair(small_buffers());
    let mut stalled = relay.open_link();
    let stalled_remote = worker.accept_link().await.unwrap();
    let mut stalled = (&mut stalled).await.unwrap();
    // Nobody reads stalled_remote; writes stop once its credit runs out
    let blocked = tokio::time::timeout(
      Duration::from_millis(200),
      stalled.write_all(&vec![7u8; 64 * 1024]),
    )
    .await;
    assert!(blocked.is_err(), "writer should be held back by credit");

    let open = relay.open_link();
    let mut remote = worker.accept_link().await.unwrap();
    let mut local = open.await.unwrap();
    local.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), remote.read_exact(&mut buf))
      .await
      .expect("sibling stream must still flow")
      .unwrap();
    assert_eq!(&buf, b"ping");
    drop(stalled_remote);
  }

  #[tokio::test]
  async fn physical_failure_fails_every_stream() {
    let (relay_io, worker_io) = tokio::io::duplex(64 * 1024);
    let relay = MuxSession::new(relay_io, TunnelSide::Listen, MuxConfig::default());
    let worker_task = tokio::spawn(async move {
      let worker = MuxSession::new(worker_io, TunnelSide::Connect, MuxConfig::default());
      let stream = worker.accept_link().await.unwrap();
      (worker, stream)
    });
    let mut stream = relay.open_link().await.unwrap();
    let (worker, _remote) = worker_task.await.unwrap();

    worker.close().await;
    let reason = tokio::time::timeout(Duration::from_secs(5), relay.on_closed())
      .await
      .expect("relay must notice the closed connection");
    assert_eq!(reason, TunnelError::ConnectionClosed);
    assert!(relay.is_closed());

    let mut buf = [0u8; 1];
    assert!(stream.read(&mut buf).await.is_err());
    assert!(stream.write_all(b"x").await.is_err());
    assert!(relay.open_link().await.is_err());
  }

  #[tokio::test]
  async fn silent_peer_times_out() {
    let (relay_io, _silent_peer) = tokio::io::duplex(1024);
    let relay = MuxSession::new(
      relay_io,
      TunnelSide::Listen,
      MuxConfig {
        keep_alive_interval: Duration::from_millis(20),
        keep_alive_timeout: Duration::from_millis(60),
        ..Default::default()
      },
    );
    let reason = tokio::time::timeout(Duration::from_secs(5), relay.on_closed())
      .await
      .unwrap();
    assert_eq!(reason, TunnelError::TimedOut);
  }

  #[tokio::test]
  async fn keep_alive_holds_idle_session_open() {
    let config = MuxConfig {
      keep_alive_interval: Duration::from_millis(20),
      keep_alive_timeout: Duration::from_millis(60),
      ..Default::default()
    };
    let (relay, worker) = pair(config);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!relay.is_closed());
    assert!(!worker.is_closed());
  }

  #[tokio::test]
  async fn unaccepted_stream_times_out() {
    let (relay, _worker) = pair(MuxConfig {
      stream_accept_deadline: Duration::from_millis(50),
      ..Default::default()
    });
    assert_eq!(
      relay.open_link().await.err(),
      Some(TunnelError::AcceptTimeout)
    );
  }

  #[tokio::test]
  async fn full_accept_queue_resets_only_the_new_stream() {
    let (relay, worker) = pair(MuxConfig {
      accept_queue: 1,
      stream_accept_deadline: Duration::from_secs(5),
      ..Default::default()
    });
    let first = relay.open_link();
    // Let the first SYN occupy the only queue slot
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = relay.open_link().await;
    assert_eq!(second.err(), Some(TunnelError::StreamReset));

    let _accepted = worker.accept_link().await.unwrap();
    assert!(first.await.is_ok());
    assert!(!relay.is_closed());
  }

  #[tokio::test]
  async fn close_is_idempotent_and_reported() {
    let (relay, _worker) = pair(MuxConfig::default());
    relay.close().await;
    relay.close().await;
    assert_eq!(relay.on_closed().await, TunnelError::LocallyClosed);
    assert!(relay.accept_link().await.is_err());
  }

  #[tokio::test]
  async fn dropped_streams_are_forgotten() {
    let (relay, worker) = pair(MuxConfig::default());
    let open = relay.open_link();
    let remote = worker.accept_link().await.unwrap();
    let local = open.await.unwrap();
    assert_eq!(relay.stream_count(), 1);
    drop(local);
    drop(remote);
    assert_eq!(relay.stream_count(), 0);
    tokio::time::timeout(Duration::from_secs(5), async {
      while worker.stream_count() != 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
  }
}
