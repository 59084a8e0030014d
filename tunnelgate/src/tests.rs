// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Relay, tunnel client, and a local HTTP service wired together over loopback sockets

use std::{
  convert::Infallible,
  net::SocketAddr,
  sync::Arc,
  time::{Duration, SystemTime},
};

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Empty, Full};
use hyper::{
  body::Incoming,
  header::{AUTHORIZATION, CONNECTION, HOST, UPGRADE},
  service::service_fn,
  Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream},
  sync::oneshot,
};
use tokio_util::sync::CancellationToken;

use crate::{
  client::{BackoffConfig, ClientConfig, ClientError, ClientState, StaticConfigurer, TunnelClient},
  common::{
    authentication::{sign_token, BearerTokenAuthorizer, TokenValidator, TunnelClaims},
    protocol::{
      http::{RequestHead, ORIGINAL_PATH_HEADER},
      mux::UPGRADE_PROTOCOL,
      proxy_tcp::LocalForwarder,
      tunnel::{SessionId, WorkerId},
    },
  },
  server::{RelayConfig, RelayGateway},
  util::cancellation::CancellationListener,
};

const SECRET_A: &str = "secret-a";
const SECRET_B: &str = "secret-b";
const DEADLINE: Duration = Duration::from_secs(10);

fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn token(id: &str, secret: &str) -> String {
  sign_token(
    &TunnelClaims::new(id, SystemTime::now(), Duration::from_secs(3600)),
    secret.as_bytes(),
  )
  .unwrap()
}

/// Answers `GET /status` with `200 OK`; any other path is a 404
async fn local_service() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (socket, _) = listener.accept().await.unwrap();
      tokio::spawn(async move {
        let service = service_fn(|request: Request<Incoming>| async move {
          let (status, body) = match request.uri().path() {
            "/status" => (StatusCode::OK, "OK"),
            _ => (StatusCode::NOT_FOUND, "missing"),
          };
          let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
          *response.status_mut() = status;
          if let Some(original) = request.headers().get(ORIGINAL_PATH_HEADER) {
            response
              .headers_mut()
              .insert("x-echo-original-path", original.clone());
          }
          Ok::<_, Infallible>(response)
        });
        let _ = hyper::server::conn::http1::Builder::new()
          .serve_connection(TokioIo::new(socket), service)
          .await;
      });
    }
  });
  addr
}

/// Switches one connection to an `echo` protocol that returns every byte it
/// receives, reporting the request head it was upgraded with
async fn echo_upgrade_service() -> (SocketAddr, oneshot::Receiver<RequestHead>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (seen_tx, seen_rx) = oneshot::channel();
  tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buffer = BytesMut::new();
    let head = RequestHead::read(&mut socket, &mut buffer).await.unwrap();
    socket
      .write_all(b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: echo\r\n\r\n")
      .await
      .unwrap();
    let _ = seen_tx.send(head);
    let (mut reader, mut writer) = socket.split();
    writer.write_all(&buffer).await.unwrap();
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
  });
  (addr, seen_rx)
}

struct Relay {
  addr: SocketAddr,
  gateway: Arc<RelayGateway>,
  shutdown: CancellationToken,
}

impl Relay {
  async fn start() -> Relay {
    let validator = TokenValidator::new(SECRET_A, SECRET_B);
    let gateway = RelayGateway::new(
      RelayConfig::default(),
      Arc::new(BearerTokenAuthorizer::new(validator)),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&gateway).serve(
      listener,
      None,
      CancellationListener::from(&shutdown),
      Duration::from_secs(1),
    ));
    Relay {
      addr,
      gateway,
      shutdown,
    }
  }

  fn client_config(&self, id: &str, token: String) -> ClientConfig {
    let mut config = ClientConfig::new(
      WorkerId::parse(id).unwrap(),
      token,
      format!("http://{}", self.addr),
    );
    config.backoff = BackoffConfig {
      initial_delay: Duration::from_millis(10),
      max_delay: Duration::from_millis(100),
      max_elapsed_time: Duration::from_secs(5),
      ..Default::default()
    };
    config
  }

  fn session_id(&self, id: &str) -> Option<SessionId> {
    let id = WorkerId::parse(id).unwrap();
    self.gateway.registry().lookup(&id).ok().map(|s| s.session_id())
  }

  async fn get(&self, path: &str) -> (StatusCode, String, Option<String>) {
    let socket = TcpStream::connect(self.addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(socket))
      .await
      .unwrap();
    tokio::spawn(conn);
    let request = Request::get(path)
      .header(HOST, "relay.test")
      .body(Empty::<Bytes>::new())
      .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let original = response
      .headers()
      .get("x-echo-original-path")
      .and_then(|v| v.to_str().ok())
      .map(str::to_string);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap(), original)
  }
}

/// A registered worker forwarding to `local`
async fn start_worker(
  relay: &Relay,
  local: SocketAddr,
) -> (Arc<TunnelClient>, CancellationToken) {
  let config = relay.client_config("W1", token("W1", SECRET_A));
  let client = TunnelClient::connect(Arc::new(StaticConfigurer(config)))
    .await
    .unwrap();
  let client = Arc::new(client);
  let stop = CancellationToken::new();
  let forwarder = LocalForwarder::new(local);
  let (running, listener) = (Arc::clone(&client), CancellationListener::from(&stop));
  tokio::spawn(async move { forwarder.run(&running, listener).await });
  (client, stop)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_reaches_worker_service() {
  init_logging();
  let relay = Relay::start().await;
  let (client, stop) = start_worker(&relay, local_service().await).await;
  assert_eq!(client.url(), format!("http://{}/W1", relay.addr));

  let (status, body, original) = tokio::time::timeout(DEADLINE, relay.get("/W1/status"))
    .await
    .unwrap();
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, "OK");
  assert_eq!(original.as_deref(), Some("/W1/status"));

  let (status, _, _) = tokio::time::timeout(DEADLINE, relay.get("/W1/elsewhere"))
    .await
    .unwrap();
  assert_eq!(status, StatusCode::NOT_FOUND);

  stop.cancel();
  client.close().await;
  relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn protocol_upgrade_passes_through() {
  init_logging();
  let relay = Relay::start().await;
  let (local, seen) = echo_upgrade_service().await;
  let (client, stop) = start_worker(&relay, local).await;

  tokio::time::timeout(DEADLINE, async {
    let mut caller = TcpStream::connect(relay.addr).await.unwrap();
    caller
      .write_all(b"GET /W1/chat HTTP/1.1\r\nhost: relay.test\r\nconnection: upgrade\r\nupgrade: echo\r\n\r\n")
      .await
      .unwrap();
    let mut response = Vec::new();
    while !response.ends_with(b"\r\n\r\n") {
      response.push(caller.read_u8().await.unwrap());
    }
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 101"), "{response}");
    assert!(response.contains("upgrade: echo"), "{response}");

    let head = seen.await.unwrap();
    assert_eq!(head.path(), "/chat");
    assert!(head.is_upgrade());
    assert_eq!(head.header_str("upgrade"), Some("echo"));

    for message in [&b"ping"[..], &b"a longer second message"[..]] {
      caller.write_all(message).await.unwrap();
      let mut echoed = vec![0u8; message.len()];
      caller.read_exact(&mut echoed).await.unwrap();
      assert_eq!(echoed, message);
    }
  })
  .await
  .expect("upgraded exchange must complete");

  stop.cancel();
  client.close().await;
  relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unregistered_worker_is_not_found() {
  init_logging();
  let relay = Relay::start().await;
  let (status, _, _) = tokio::time::timeout(DEADLINE, relay.get("/W2/status"))
    .await
    .expect("404 must not block");
  assert_eq!(status, StatusCode::NOT_FOUND);
  relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarding_resumes_after_connection_loss() {
  init_logging();
  let relay = Relay::start().await;
  let (client, stop) = start_worker(&relay, local_service().await).await;
  let first = relay.session_id("W1").unwrap();
  let mut states = client.watch_state();

  // Sever the physical connection from the relay's side
  let id = WorkerId::parse("W1").unwrap();
  let session = relay.gateway.registry().lookup(&id).unwrap();
  session.tunnel().close().await;

  tokio::time::timeout(DEADLINE, async {
    loop {
      if let Some(current) = relay.session_id("W1") {
        if current != first {
          return;
        }
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("worker must re-register");
  tokio::time::timeout(DEADLINE, states.wait_for(|s| *s == ClientState::Connected))
    .await
    .unwrap()
    .unwrap();

  let (status, body, _) = tokio::time::timeout(DEADLINE, relay.get("/W1/status"))
    .await
    .unwrap();
  assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));

  stop.cancel();
  client.close().await;
  relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_registration_conflicts() {
  init_logging();
  let relay = Relay::start().await;
  let (client, stop) = start_worker(&relay, local_service().await).await;

  let socket = TcpStream::connect(relay.addr).await.unwrap();
  let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(socket))
    .await
    .unwrap();
  tokio::spawn(conn.with_upgrades());
  let request = Request::get("/register/W1")
    .header(HOST, "relay.test")
    .header(CONNECTION, "upgrade")
    .header(UPGRADE, UPGRADE_PROTOCOL)
    .header(AUTHORIZATION, format!("Bearer {}", token("W1", SECRET_B)))
    .body(Empty::<Bytes>::new())
    .unwrap();
  let response = tokio::time::timeout(DEADLINE, sender.send_request(request))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(response.status(), StatusCode::CONFLICT);
  assert_eq!(client.state(), ClientState::Connected);

  stop.cancel();
  client.close().await;
  relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_token_is_rejected_without_retry() {
  init_logging();
  let relay = Relay::start().await;
  let config = relay.client_config("W1", token("W1", "not-a-relay-secret"));
  let result = tokio::time::timeout(
    DEADLINE,
    TunnelClient::connect(Arc::new(StaticConfigurer(config))),
  )
  .await
  .unwrap();
  assert_eq!(result.unwrap_err(), ClientError::RetryFailed { status: 401 });
  assert!(relay.session_id("W1").is_none());
  relay.shutdown.cancel();
}
