//! TCP connections to the mail server, optionally through the configured proxy

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::{CloudMailError, Result};

/// Upper bound on a proxy's CONNECT reply head
const MAX_CONNECT_REPLY: usize = 8 * 1024;

fn proxy_err(e: impl std::fmt::Display) -> CloudMailError {
    CloudMailError::Imap(format!("proxy: {}", e))
}

/// Open a TCP stream to `host:port`, tunnelled through `proxy` when it is enabled.
///
/// `socks5`/`socks5h` and `socks4`/`socks4a` use the SOCKS handshake; `http` and `https`
/// issue a plain `CONNECT` to the proxy.
pub async fn open(host: &str, port: u16, proxy: &ProxyConfig) -> Result<TcpStream> {
    if !proxy.enabled {
        return TcpStream::connect((host, port))
            .await
            .map_err(|e| CloudMailError::Imap(format!("connect to {}:{}: {}", host, port, e)));
    }

    let proxy_addr = (proxy.host.as_str(), proxy.port);
    debug!(
        "Tunnelling to {}:{} through {} proxy {}:{}",
        host, port, proxy.protocol, proxy.host, proxy.port
    );

    match proxy.protocol.to_ascii_lowercase().as_str() {
        "socks5" | "socks5h" => Socks5Stream::connect(proxy_addr, (host, port))
            .await
            .map(Socks5Stream::into_inner)
            .map_err(proxy_err),
        "socks4" | "socks4a" => Socks4Stream::connect(proxy_addr, (host, port))
            .await
            .map(Socks4Stream::into_inner)
            .map_err(proxy_err),
        "http" | "https" => {
            let mut stream = TcpStream::connect(proxy_addr).await.map_err(proxy_err)?;
            http_connect(&mut stream, host, port).await?;
            Ok(stream)
        }
        other => Err(CloudMailError::Config(format!(
            "unsupported proxy protocol '{}'",
            other
        ))),
    }
}

/// Ask an HTTP proxy for a tunnel. The reply is read byte by byte so nothing the
/// server sends after it is consumed.
async fn http_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.map_err(proxy_err)?;

    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_REPLY {
            return Err(proxy_err("CONNECT reply too long"));
        }
        if stream.read(&mut byte).await.map_err(proxy_err)? == 0 {
            return Err(proxy_err("connection closed during CONNECT"));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some(code) if code.starts_with('2') => Ok(()),
        _ => Err(proxy_err(format!("CONNECT refused: {}", status_line))),
    }
}
