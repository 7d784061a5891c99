//! HTTP CONNECT negotiation

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    Take,
};
use tracing::{trace, warn};

use super::address::TargetAddr;
use crate::error::TunnelError;

/// Status line plus headers may not exceed this
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// `CONNECT` request for `target`
#[must_use]
pub fn connect_request(target: &TargetAddr, credentials: Option<(&str, &str)>) -> String {
    let authority = target.authority();
    let mut req = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some((user, password)) = credentials {
        let token = STANDARD.encode(format!("{user}:{password}"));
        req.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    req.push_str("\r\n");
    req
}

/// Parse `HTTP/1.x <status> <reason>`
///
/// # Errors
/// Returns `TunnelError::Protocol` if the line is not a status line.
pub fn parse_status_line(line: &str) -> Result<(u16, String), TunnelError> {
    let line = line.trim_end();
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TunnelError::protocol(
            "HTTP",
            format!("malformed response: {line:?}"),
        ));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| TunnelError::protocol("HTTP", format!("invalid status in {line:?}")))?;
    Ok((status, parts.next().unwrap_or_default().to_string()))
}

/// Ask the proxy on `stream` to open a tunnel to `target`.
///
/// Succeeds only on status 200. Returns any bytes the proxy sent past the
/// end of the response head; they belong to the tunnelled stream.
///
/// # Errors
/// `TunnelError::Http` for a non-200 status, `TunnelError::Protocol` for a
/// malformed or truncated response, `TunnelError::IoError` on I/O failure.
pub async fn http_connect<S>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<(&str, &str)>,
) -> Result<Vec<u8>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = connect_request(target, credentials);
    trace!("Sending HTTP CONNECT for {}", target);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // the limit caps every line, the first one included
    let mut reader = BufReader::new(stream).take(MAX_RESPONSE_HEAD as u64);
    let mut line = String::new();
    read_head_line(&mut reader, &mut line, "connection closed before response").await?;
    let (status, message) = parse_status_line(&line)?;
    if status != 200 {
        warn!("HTTP proxy answered CONNECT {} with {} {}", target, status, message);
        return Err(TunnelError::Http { status, message });
    }

    loop {
        line.clear();
        read_head_line(&mut reader, &mut line, "connection closed inside headers").await?;
        if line.trim().is_empty() {
            break;
        }
    }

    Ok(reader.get_ref().buffer().to_vec())
}

/// Read one full response-head line into `line`
async fn read_head_line<R>(
    reader: &mut Take<R>,
    line: &mut String,
    closed: &'static str,
) -> Result<(), TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    reader.read_line(line).await?;
    if line.ends_with('\n') {
        return Ok(());
    }
    if reader.limit() == 0 {
        Err(TunnelError::protocol("HTTP", "response head too large"))
    } else {
        Err(TunnelError::protocol("HTTP", closed))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Proxy stub: captures the request head, answers with `response`
    async fn mock_proxy(response: &'static [u8]) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            stream.write_all(response).await.unwrap();
            String::from_utf8(head).unwrap()
        });
        (addr, handle)
    }

    #[test]
    fn test_connect_request_with_auth() {
        let req = connect_request(
            &TargetAddr::Domain("example.com".into(), 443),
            Some(("user", "pass")),
        );
        assert!(req.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com:443\r\n"));
        assert!(req.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_connect_request_without_auth() {
        let req = connect_request(&TargetAddr::Ip("1.2.3.4:80".parse().unwrap()), None);
        assert_eq!(req, "CONNECT 1.2.3.4:80 HTTP/1.1\r\nHost: 1.2.3.4:80\r\n\r\n");
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(
            parse_status_line("HTTP/1.1 200 Connection established\r\n").unwrap(),
            (200, "Connection established".to_string())
        );
        assert_eq!(parse_status_line("HTTP/1.0 407\r\n").unwrap().0, 407);
        assert!(parse_status_line("SSH-2.0-OpenSSH\r\n").is_err());
        assert!(parse_status_line("HTTP/1.1 abc\r\n").is_err());
    }

    #[tokio::test]
    async fn test_http_connect_200() {
        let (addr, server) =
            mock_proxy(b"HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\n").await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let leftover = http_connect(
            &mut stream,
            &TargetAddr::Domain("example.com".into(), 443),
            Some(("u", "p")),
        )
        .await
        .unwrap();
        assert!(leftover.is_empty());

        let head = server.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1"));
        assert!(head.contains("Proxy-Authorization: Basic dTpw"));
    }

    #[tokio::test]
    async fn test_http_connect_keeps_early_payload() {
        let (addr, _server) = mock_proxy(b"HTTP/1.1 200 OK\r\n\r\nhello").await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let target = TargetAddr::Ip("1.2.3.4:80".parse().unwrap());

        let mut leftover = http_connect(&mut stream, &target, None).await.unwrap();
        // the payload may arrive after the head was parsed
        while leftover.len() < 5 {
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            leftover.extend_from_slice(&buf[..n]);
        }
        assert_eq!(leftover, b"hello");
    }

    #[tokio::test]
    async fn test_http_connect_407() {
        let (addr, _server) =
            mock_proxy(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let err = http_connect(
            &mut stream,
            &TargetAddr::Domain("example.com".into(), 443),
            None,
        )
        .await
        .unwrap_err();
        match err {
            TunnelError::Http { status, message } => {
                assert_eq!(status, 407);
                assert_eq!(message, "Proxy Authentication Required");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_http_connect_truncated() {
        let (addr, _server) = mock_proxy(b"HTTP/1.1 200 OK\r\nVia: x\r\n").await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let err = http_connect(&mut stream, &TargetAddr::Domain("a.io".into(), 1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Protocol { proxy: "HTTP", .. }));
    }

    #[tokio::test]
    async fn test_http_connect_unterminated_status_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await.unwrap();
            // a status line that never ends, connection held open
            stream.write_all(b"HTTP/1.1 200 ").await.unwrap();
            stream.write_all(&vec![b'a'; MAX_RESPONSE_HEAD + 1]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let target = TargetAddr::Domain("a.io".into(), 1);
        let err = tokio::time::timeout(Duration::from_secs(3), http_connect(&mut stream, &target, None))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
    }
}
