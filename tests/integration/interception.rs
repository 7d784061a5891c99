//! Whole-scope interception tests
//!
//! A scope is started with plain (non-TPROXY) sockets, so a client talking
//! to the listener directly looks like an intercepted flow whose original
//! destination is the listener itself. The upstream is a mock SOCKS5 proxy
//! that echoes TCP streams and UDP datagrams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use rust_procproxy::cgroup::{ControllerManager, Priority};
use rust_procproxy::config::{ProxyServer, ProxyType, ScopeConfig, ScopeKind};
use rust_procproxy::iptables::{FilterSession, RecordingExecutor, MAIN_CHAIN};
use rust_procproxy::scope::{ProxyScope, ScopeContext, MAIN_CONTROLLER};
use rust_procproxy::tproxy::PlainSocketProvider;
use rust_procproxy::tunnel::TunnelTimeouts;

/// Read the SOCKS5 address that follows an ATYP byte
async fn read_address(stream: &mut TcpStream, atyp: u8) -> Vec<u8> {
    let len = match atyp {
        1 => 4,
        4 => 16,
        _ => usize::from(stream.read_u8().await.unwrap()),
    };
    let mut rest = vec![0u8; len + 2];
    stream.read_exact(&mut rest).await.unwrap();
    rest
}

async fn serve_socks5(mut stream: TcpStream) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.unwrap();
    let mut methods = vec![0u8; usize::from(head[1])];
    stream.read_exact(&mut methods).await.unwrap();
    stream.write_all(&[5, 0]).await.unwrap();

    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await.unwrap();
    let addr = read_address(&mut stream, req[3]).await;

    match req[1] {
        1 => {
            stream
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            let (mut rd, mut wr) = stream.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        }
        3 => {
            // loopback placeholder; an unexpected request gets no reply
            assert_eq!(req[3], 1);
            assert_eq!(addr, [127, 0, 0, 1, 0, 0]);
            let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = relay.local_addr().unwrap().port().to_be_bytes();
            stream
                .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, port[0], port[1]])
                .await
                .unwrap();
            let mut buf = vec![0u8; 65535];
            let mut control = [0u8; 64];
            loop {
                tokio::select! {
                    r = relay.recv_from(&mut buf) => {
                        let (n, from) = r.unwrap();
                        // the envelope names the target; echo it back as the reply
                        relay.send_to(&buf[..n], from).await.unwrap();
                    }
                    n = stream.read(&mut control) => {
                        if matches!(n, Ok(0) | Err(_)) {
                            break;
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

async fn mock_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_socks5(stream));
        }
    });
    addr
}

struct Harness {
    scope: ProxyScope,
    ctx: ScopeContext,
    exec: Arc<RecordingExecutor>,
    _root: tempfile::TempDir,
}

async fn start_scope(kind: ScopeKind) -> Harness {
    let upstream = mock_upstream().await;
    let root = tempfile::tempdir().unwrap();
    let exec = Arc::new(RecordingExecutor::new());
    let controllers = Arc::new(ControllerManager::new(root.path()));
    controllers
        .create_priority_controller(MAIN_CONTROLLER, Priority::MAIN)
        .unwrap();

    let ctx = ScopeContext::new(Arc::new(FilterSession::new(exec.clone())), controllers)
        .with_socket_provider(Arc::new(PlainSocketProvider::new()))
        .with_timeouts(TunnelTimeouts {
            dial: Duration::from_secs(1),
            handshake: Duration::from_secs(1),
            udp_idle: Duration::from_secs(5),
        });
    let cfg = ScopeConfig::new(
        kind,
        0,
        8090,
        ProxyType::Sock5,
        ProxyServer::new("mock", upstream.ip().to_string(), upstream.port()),
    );

    let mut scope = ProxyScope::new(cfg, ctx.clone());
    scope.start().unwrap();
    Harness {
        scope,
        ctx,
        exec,
        _root: root,
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_tcp_flow_relayed_and_cleaned_up() {
    let mut h = start_scope(ScopeKind::App).await;
    let listen = h.scope.tcp_addr().unwrap();

    let mut client = TcpStream::connect(listen).await.unwrap();
    client.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    tokio::time::timeout(Duration::from_secs(3), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the tunnel");
    assert_eq!(h.ctx.registry.len_scope(ScopeKind::App), 1);

    drop(client);
    let registry = Arc::clone(&h.ctx.registry);
    wait_for(|| registry.is_empty()).await;

    h.scope.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_flow_relayed_through_association() {
    let mut h = start_scope(ScopeKind::Global).await;
    let listen = h.scope.udp_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"first", listen).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"first");
    assert_eq!(h.ctx.registry.len_scope(ScopeKind::Global), 1);

    // later datagrams still reaching the listener join the same flow
    client.send_to(b"second", listen).await.unwrap();
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"second");
    assert_eq!(h.ctx.registry.len(), 1);

    h.scope.stop().await.unwrap();
    assert!(h.ctx.registry.is_empty());
}

#[tokio::test]
async fn test_stop_removes_rules_and_controller() {
    let mut h = start_scope(ScopeKind::App).await;
    assert_eq!(h.exec.count_matching("-I Main 1 -j App"), 1);
    assert!(h.ctx.controllers.controller("app").is_some());

    h.scope.stop().await.unwrap();

    assert!(h.ctx.controllers.controller("app").is_none());
    assert!(h.ctx.controllers.controller(MAIN_CONTROLLER).is_some());
    assert_eq!(h.exec.count_matching("-X App"), 1);
    assert_eq!(h.exec.count_matching("-X Main"), 1);
    h.ctx.session.with_table(|t| assert!(!t.contains(MAIN_CHAIN)));

    // restartable on the same context
    h.scope.start().unwrap();
    assert!(h.scope.is_running());
    h.scope.stop().await.unwrap();
}
