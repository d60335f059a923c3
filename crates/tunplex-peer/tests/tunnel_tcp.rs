//! Client and server talking over real loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tunplex_frame::{CipherConfig, CipherSpec, FrameConfig};
use tunplex_peer::{
    ClientConnector, ConnectMode, ConnectionPool, Destination, Dispatcher, ImuxPlan, PeerError,
    PoolConfig, SessionConfig, TcpDialer, TunnelListener,
};
use tunplex_transport::{BoxMsgStream, MsgStream};

const KEY: &str = "correct horse battery staple";

fn frame_config() -> FrameConfig {
    let cipher = CipherConfig::new(CipherSpec::default_stream(), KEY).unwrap();
    FrameConfig::default().with_cipher(cipher)
}

fn session_config() -> SessionConfig {
    let spec: CipherSpec = "chacha20,crc32c".parse().unwrap();
    SessionConfig {
        channel_cipher: Some(CipherConfig::new(spec, KEY).unwrap()),
        request_timeout: Duration::from_secs(5),
    }
}

/// TCP server that echoes every byte back.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn tunnel_server(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> SocketAddr {
    let listener = TunnelListener::bind("127.0.0.1:0", frame_config(), dispatcher)
        .await
        .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(async move { listener.run(cancel).await });
    addr
}

fn connector(server: SocketAddr) -> ClientConnector {
    let dialer = TcpDialer::new(server.to_string(), frame_config());
    ClientConnector::new(Arc::new(dialer), session_config())
}

async fn read_exactly(stream: &BoxMsgStream, len: usize) -> Vec<u8> {
    let mut got = Vec::new();
    while got.len() < len {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("echo timed out")
            .unwrap()
            .expect("stream ended early");
        got.extend_from_slice(&msg);
    }
    got
}

#[tokio::test]
async fn pooled_connect_relays_through_the_server() {
    let echo = echo_server().await;
    let cancel = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(session_config()));
    let server = tunnel_server(dispatcher, cancel.clone()).await;

    let pool = ConnectionPool::new(Arc::new(connector(server)), PoolConfig::default()).unwrap();
    let conn = pool
        .connect(&Destination::from(echo), ConnectMode::Safe)
        .await
        .unwrap();
    let reply = conn.confirmation.wait().await.unwrap();
    assert_eq!(reply.endpoint, Destination::from(echo));

    conn.stream.send(Bytes::from_static(b"over the tunnel")).await.unwrap();
    assert_eq!(read_exactly(&conn.stream, 15).await, b"over the tunnel");

    let stats = pool.stats();
    assert!(stats.connected >= 1);
    assert_eq!(stats.local_channels, 1);

    pool.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn fast_open_to_a_closed_port_is_rejected_in_the_confirmation() {
    let closed = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap()
    };
    let cancel = CancellationToken::new();
    let server = tunnel_server(Arc::new(Dispatcher::new(session_config())), cancel.clone()).await;

    let session = connector(server).connect(&cancel).await.unwrap();
    let conn = session
        .connect(&Destination::from(closed), ConnectMode::FastOpen)
        .await
        .unwrap();
    match conn.confirmation.wait().await {
        Err(PeerError::Rejected { status, message }) => {
            assert_eq!(status, tunplex_peer::status::FAILED);
            assert!(!message.is_empty());
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(!session.is_closed());
    cancel.cancel();
}

#[tokio::test]
async fn imux_session_over_tcp() {
    let echo = echo_server().await;
    let cancel = CancellationToken::new();
    let server = tunnel_server(Arc::new(Dispatcher::new(session_config())), cancel.clone()).await;

    let plan = ImuxPlan::new(1, 1, 2).with_delay(Duration::from_millis(5));
    let session = connector(server)
        .with_imux(plan)
        .connect(&cancel)
        .await
        .unwrap();

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let conn = session
        .connect(&Destination::from(echo), ConnectMode::Safe)
        .await
        .unwrap();
    for chunk in payload.chunks(8 * 1024) {
        conn.stream.send(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    assert_eq!(read_exactly(&conn.stream, payload.len()).await, payload);

    session.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn wrong_key_never_yields_a_session() {
    let cancel = CancellationToken::new();
    let server = tunnel_server(Arc::new(Dispatcher::new(session_config())), cancel.clone()).await;

    let frame = FrameConfig::default()
        .with_cipher(CipherConfig::new(CipherSpec::default_stream(), "not the key").unwrap());
    let dialer = TcpDialer::new(server.to_string(), frame);
    let connector = ClientConnector::new(
        Arc::new(dialer),
        SessionConfig {
            request_timeout: Duration::from_millis(500),
            ..SessionConfig::default()
        },
    );
    assert!(connector.connect(&cancel).await.is_err());
    cancel.cancel();
}

#[tokio::test]
async fn network_members_can_be_listed_and_dialed() {
    let echo = echo_server().await;
    let cancel = CancellationToken::new();
    let hub = tunnel_server(Arc::new(Dispatcher::new(session_config())), cancel.clone()).await;

    let member_link = connector(hub).connect(&cancel).await.unwrap();
    let member_dispatcher = Arc::new(Dispatcher::new(session_config()));
    let _joined = member_link
        .network_join("edge-1", member_dispatcher)
        .await
        .unwrap();

    let client = connector(hub).connect(&cancel).await.unwrap();
    let mut names = Vec::new();
    for _ in 0..50 {
        names = client.network_list().await.unwrap();
        if !names.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(names, vec!["edge-1".to_string()]);

    let (stream, endpoint) = client
        .network_dial("edge-1", &Destination::from(echo))
        .await
        .unwrap();
    assert_eq!(endpoint, Destination::from(echo));
    stream.send(Bytes::from_static(b"via member")).await.unwrap();
    assert_eq!(read_exactly(&stream, 10).await, b"via member");

    let missing = client
        .network_dial("edge-2", &Destination::from(echo))
        .await
        .err()
        .expect("dial to unknown member should fail");
    assert!(missing.to_string().contains("edge-2"));

    member_link.close().await;
    cancel.cancel();
}
