//! Tunnel handshake integration tests
//!
//! Each test runs a one-shot mock proxy on `127.0.0.1:0` and drives a
//! `TunnelHandler` against it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use rust_procproxy::config::{ProxyServer, ProxyType, ScopeKind};
use rust_procproxy::error::TunnelError;
use rust_procproxy::tunnel::{
    HandlerKey, HandlerRegistry, TargetAddr, TunnelHandler, TunnelState, TunnelTimeouts,
};

const TARGET: &str = "93.184.216.34:80";

fn key(src_port: u16) -> HandlerKey {
    HandlerKey::new(
        SocketAddr::from(([10, 0, 0, 2], src_port)),
        TARGET.parse().unwrap(),
    )
}

fn timeouts() -> TunnelTimeouts {
    TunnelTimeouts {
        dial: Duration::from_secs(1),
        handshake: Duration::from_secs(1),
        udp_idle: Duration::from_secs(1),
    }
}

fn handler(proxy_type: ProxyType, server: ProxyServer) -> Arc<TunnelHandler> {
    TunnelHandler::new(
        ScopeKind::App,
        key(40000),
        TargetAddr::Ip(TARGET.parse().unwrap()),
        proxy_type,
        server,
        timeouts(),
        Arc::new(HandlerRegistry::new()),
    )
}

fn server(addr: SocketAddr) -> ProxyServer {
    ProxyServer::new("mock", addr.ip().to_string(), addr.port())
}

/// SOCKS4 proxy answering with `reply`; sends the request it saw on `seen`
async fn socks4_proxy(reply: [u8; 8]) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut req = vec![0u8; 8];
        stream.read_exact(&mut req).await.unwrap();
        // user id up to the NUL
        loop {
            let b = stream.read_u8().await.unwrap();
            req.push(b);
            if b == 0 {
                break;
            }
        }
        let _ = tx.send(req);
        stream.write_all(&reply).await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });
    (addr, rx)
}

/// SOCKS5 proxy that selects `method`, answers the auth step with
/// `auth_reply` and the CONNECT with `reply_code`
async fn socks5_proxy(method: u8, auth_reply: [u8; 2], reply_code: u8) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        let mut methods = vec![0u8; usize::from(head[1])];
        stream.read_exact(&mut methods).await.unwrap();
        stream.write_all(&[5, method]).await.unwrap();

        if method == 2 {
            let ver = stream.read_u8().await.unwrap();
            assert_eq!(ver, 1);
            let ulen = stream.read_u8().await.unwrap();
            let mut user = vec![0u8; usize::from(ulen)];
            stream.read_exact(&mut user).await.unwrap();
            let plen = stream.read_u8().await.unwrap();
            let mut pass = vec![0u8; usize::from(plen)];
            stream.read_exact(&mut pass).await.unwrap();
            stream.write_all(&auth_reply).await.unwrap();
            if auth_reply[1] != 0 {
                return;
            }
        }

        let mut req = [0u8; 10];
        if stream.read_exact(&mut req).await.is_err() {
            return;
        }
        stream
            .write_all(&[5, reply_code, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });
    addr
}

/// HTTP proxy answering CONNECT with `status_line`; sends the request head on `seen`
async fn http_proxy(status_line: &'static str) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut head = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            head.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }
        let _ = tx.send(head);
        let mut stream = reader.into_inner();
        stream
            .write_all(format!("{status_line}\r\nProxy-Agent: mock\r\n\r\nearly").as_bytes())
            .await
            .unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });
    (addr, rx)
}

#[tokio::test]
async fn test_socks4_granted() {
    let (addr, seen) = socks4_proxy([0x00, 0x5A, 0, 0, 0, 0, 0, 0]).await;
    let h = handler(ProxyType::Sock4, server(addr).with_auth("bob", "unused"));

    let (_upstream, leftover) = h.establish_tcp().await.unwrap();
    assert!(leftover.is_empty());
    assert_eq!(h.state(), TunnelState::Established);

    let req = seen.await.unwrap();
    assert_eq!(&req[..8], &[4, 1, 0, 80, 93, 184, 216, 34]);
    assert_eq!(&req[8..], b"bob\0");
}

#[tokio::test]
async fn test_socks4_rejected() {
    let (addr, _seen) = socks4_proxy([0x00, 0x5B, 0, 0, 0, 0, 0, 0]).await;
    let h = handler(ProxyType::Sock4, server(addr));

    let err = h.establish_tcp().await.unwrap_err();
    assert!(matches!(err, TunnelError::Socks4Rejected { code: 0x5B, .. }));
}

#[tokio::test]
async fn test_socks5_accepts_both_auth_versions() {
    for auth_reply in [[0x01, 0x00], [0x05, 0x00]] {
        let addr = socks5_proxy(2, auth_reply, 0).await;
        let h = handler(ProxyType::Sock5, server(addr).with_auth("u", "p"));
        assert!(h.establish_tcp().await.is_ok(), "auth reply {auth_reply:?}");
    }
}

#[tokio::test]
async fn test_socks5_auth_failure() {
    let addr = socks5_proxy(2, [0x01, 0x01], 0).await;
    let h = handler(ProxyType::Sock5, server(addr).with_auth("u", "wrong"));
    let err = h.establish_tcp().await.unwrap_err();
    assert!(matches!(err, TunnelError::AuthRejected { status: 1, .. }));
}

#[tokio::test]
async fn test_socks5_connect_refused() {
    let addr = socks5_proxy(0, [0, 0], 0x05).await;
    let h = handler(ProxyType::Sock5, server(addr));
    let err = h.establish_tcp().await.unwrap_err();
    assert!(matches!(err, TunnelError::Socks5Reply { code: 5, .. }));
}

#[tokio::test]
async fn test_http_connect_with_basic_auth() {
    let (addr, seen) = http_proxy("HTTP/1.1 200 Connection established").await;
    let h = handler(ProxyType::Http, server(addr).with_auth("u", "p"));

    let (_upstream, leftover) = h.establish_tcp().await.unwrap();
    assert_eq!(leftover, b"early");

    let head = seen.await.unwrap();
    assert!(head.starts_with("CONNECT 93.184.216.34:80 HTTP/1.1\r\n"));
    assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
}

#[tokio::test]
async fn test_http_non_200_fails() {
    let (addr, _seen) = http_proxy("HTTP/1.1 407 Proxy Authentication Required").await;
    let h = handler(ProxyType::Http, server(addr));
    match h.establish_tcp().await {
        Err(TunnelError::Http { status, message }) => {
            assert_eq!(status, 407);
            assert_eq!(message, "Proxy Authentication Required");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_deadline() {
    // accepts but never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    let h = handler(ProxyType::Sock5, server(addr));
    let err = h.establish_tcp().await.unwrap_err();
    assert!(matches!(err, TunnelError::Timeout { .. }));
}

#[tokio::test]
async fn test_registry_dedups_per_scope() {
    let registry = Arc::new(HandlerRegistry::new());
    let make = |scope| {
        TunnelHandler::new(
            scope,
            key(40001),
            TargetAddr::Ip(TARGET.parse().unwrap()),
            ProxyType::Sock5,
            ProxyServer::new("p", "127.0.0.1", 1),
            timeouts(),
            Arc::clone(&registry),
        )
    };

    let first = make(ScopeKind::App);
    registry.try_insert(Arc::clone(&first)).unwrap();
    assert!(matches!(
        registry.try_insert(make(ScopeKind::App)),
        Err(TunnelError::Duplicate(_))
    ));
    registry.try_insert(make(ScopeKind::Global)).unwrap();
    assert_eq!(registry.len_scope(ScopeKind::App), 1);
    assert_eq!(registry.len(), 2);

    // the survivor is still the first handler
    let stored = registry.get(ScopeKind::App, &key(40001)).unwrap();
    assert!(Arc::ptr_eq(&stored, &first));

    first.close();
    assert!(!registry.contains(ScopeKind::App, &key(40001)));
    registry.try_insert(make(ScopeKind::App)).unwrap();
}

#[tokio::test]
async fn test_relay_stops_when_client_leaves() {
    let addr = socks5_proxy(0, [0, 0], 0).await;
    let registry = Arc::new(HandlerRegistry::new());
    let h = TunnelHandler::new(
        ScopeKind::Global,
        key(40002),
        TargetAddr::Ip(TARGET.parse().unwrap()),
        ProxyType::Sock5,
        server(addr),
        timeouts(),
        Arc::clone(&registry),
    );
    registry.try_insert(Arc::clone(&h)).unwrap();

    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(local.local_addr().unwrap()).await.unwrap();
    let (accepted, _) = local.accept().await.unwrap();
    let task = tokio::spawn(Arc::clone(&h).run_tcp(accepted));

    drop(client);
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .unwrap()
        .unwrap();
    assert!(h.is_closed());
    assert!(registry.is_empty());
}
