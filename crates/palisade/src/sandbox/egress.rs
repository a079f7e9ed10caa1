//! Egress for sandboxed processes.
//!
//! With isolation on, every process starts in an empty network namespace.
//! When its sandbox permits some hosts, the only way out is an HTTP proxy
//! listening on the namespace's loopback. The proxy runs in the host
//! namespace and checks every `CONNECT` or absolute-form request against
//! the sandbox allowlist before dialing.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};
use url::Url;

use crate::validator::HostAllowlist;

/// Port the proxy listens on inside a sandbox's network namespace.
pub(crate) const PROXY_PORT: u16 = 3128;

/// Variables pointing HTTP clients at the proxy.
pub(crate) const PROXY_VARS: [&str; 6] = [
    "http_proxy",
    "https_proxy",
    "all_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
];

const MAX_HEAD_BYTES: usize = 16 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a sandboxed process may reach the network.
#[derive(Debug, Clone)]
pub(crate) enum Egress {
    /// The host's network, unconfined
    Host,
    /// An empty namespace with loopback only
    Blocked,
    /// An empty namespace whose only exit is the allowlisting proxy
    Proxied(HostAllowlist),
}

/// Proxy URL as seen from inside the sandbox.
pub(crate) fn proxy_url() -> String {
    format!("http://127.0.0.1:{PROXY_PORT}")
}

/// Serve proxy connections accepted on `listener` until the task is aborted.
/// Aborting also drops every open tunnel.
pub(crate) fn serve(listener: TcpListener, allowlist: HostAllowlist) -> JoinHandle<()> {
    let allowlist = Arc::new(allowlist);
    tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let allowlist = Arc::clone(&allowlist);
                        connections.spawn(async move {
                            if let Err(e) = handle(stream, &allowlist).await {
                                debug!(error = %e, "Egress proxy connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Egress proxy stopped accepting");
                        break;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    })
}

/// Target of one proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    tunnel: bool,
}

async fn handle(mut client: TcpStream, allowlist: &HostAllowlist) -> io::Result<()> {
    let (buf, head_len) = read_head(&mut client).await?;
    let target = match parse_head(&buf[..head_len]) {
        Ok(target) => target,
        Err(reason) => return reply(&mut client, "400 Bad Request", &reason).await,
    };
    if !allowlist.allows(&target.host) {
        warn!(host = %target.host, port = target.port, "Sandbox egress refused");
        return reply(
            &mut client,
            "403 Forbidden",
            "host is not on the sandbox egress allowlist",
        )
        .await;
    }

    let dial = TcpStream::connect((target.host.as_str(), target.port));
    let mut upstream = match tokio::time::timeout(CONNECT_TIMEOUT, dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return reply(&mut client, "502 Bad Gateway", &e.to_string()).await,
        Err(_) => return reply(&mut client, "504 Gateway Timeout", "upstream connect timed out").await,
    };
    debug!(host = %target.host, port = target.port, tunnel = target.tunnel, "Sandbox egress allowed");

    if target.tunnel {
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        upstream.write_all(&buf[head_len..]).await?;
    } else {
        upstream.write_all(&buf).await?;
    }
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Read until the end of the request head. Returns everything read so far
/// and the length of the head including its blank line.
async fn read_head(client: &mut TcpStream) -> io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok((buf, end + 4));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_head(head: &[u8]) -> Result<Target, String> {
    let text = std::str::from_utf8(head).map_err(|_| "request head is not UTF-8".to_string())?;
    let line = text.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("malformed request line `{line}`"));
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| format!("CONNECT target `{target}` has no port"))?;
        let port = port
            .parse()
            .map_err(|_| format!("CONNECT target `{target}` has an invalid port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("CONNECT target `{target}` has no host"));
        }
        return Ok(Target {
            host: host.to_string(),
            port,
            tunnel: true,
        });
    }

    let url = Url::parse(target).map_err(|e| format!("unparseable request target: {e}"))?;
    if url.scheme() != "http" {
        return Err(format!("scheme `{}` must be tunnelled with CONNECT", url.scheme()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| "request target has no host".to_string())?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(Target {
        host,
        port,
        tunnel: false,
    })
}

async fn reply(client: &mut TcpStream, status: &str, reason: &str) -> io::Result<()> {
    let body = format!("{reason}\n");
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    client.write_all(response.as_bytes()).await?;
    client.shutdown().await
}
