//! SOCKS5 server-side framing (RFC 1928) with username/password
//! authentication (RFC 1929).
//!
//! One explicit state machine per connection: GREETING -> (AUTH)? ->
//! REQUEST -> FORWARDING -> CLOSED. The handshake phases run under a read
//! deadline; forwarding is unbounded and relies on the peers.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;

pub const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Read deadline for each of GREETING / AUTH / REQUEST.
const PHASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("client offered no acceptable auth method")]
    NoAcceptableMethod,
    #[error("proxy authentication failed")]
    AuthFailed,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAtyp(u8),
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("handshake phase timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// CONNECT target extracted from a valid request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub host: String,
    pub port: u16,
}

async fn read_exact_timed<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), SocksError>
where
    S: AsyncRead + Unpin,
{
    match timeout(PHASE_TIMEOUT, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(SocksError::Io(e)),
        Err(_) => Err(SocksError::Timeout),
    }
}

/// Compare untrusted credentials without leaking a length or prefix oracle
/// through timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

/// Drive GREETING, optional AUTH and REQUEST against the client.
///
/// On `Ok` the stream is positioned right before the server reply; the caller
/// opens the upstream channel and then answers with [`reply_success`] or
/// [`reply_failure`]. On `Err` the documented failure reply (if any) has
/// already been written and the socket should be dropped.
pub async fn handshake<S>(
    stream: &mut S,
    proxy_auth: Option<&(String, String)>,
) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // --- GREETING ---
    let mut head = [0u8; 2];
    read_exact_timed(stream, &mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::Malformed("bad greeting version"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    read_exact_timed(stream, &mut methods).await?;

    let method = match proxy_auth {
        Some(_) if methods.contains(&METHOD_USERPASS) => METHOD_USERPASS,
        None if methods.contains(&METHOD_NO_AUTH) => METHOD_NO_AUTH,
        _ => {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
                .await?;
            return Err(SocksError::NoAcceptableMethod);
        }
    };
    stream.write_all(&[SOCKS_VERSION, method]).await?;

    // --- AUTH (RFC 1929) ---
    if let (METHOD_USERPASS, Some((want_user, want_pass))) = (method, proxy_auth) {
        let mut head = [0u8; 2];
        read_exact_timed(stream, &mut head).await?;
        if head[0] != AUTH_VERSION {
            return Err(SocksError::Malformed("bad auth version"));
        }
        let mut uname = vec![0u8; head[1] as usize];
        read_exact_timed(stream, &mut uname).await?;

        let mut plen = [0u8; 1];
        read_exact_timed(stream, &mut plen).await?;
        let mut passwd = vec![0u8; plen[0] as usize];
        read_exact_timed(stream, &mut passwd).await?;

        let user_ok = constant_time_eq(&uname, want_user.as_bytes());
        let pass_ok = constant_time_eq(&passwd, want_pass.as_bytes());
        if user_ok && pass_ok {
            stream.write_all(&[AUTH_VERSION, 0x00]).await?;
        } else {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            return Err(SocksError::AuthFailed);
        }
    }

    // --- REQUEST ---
    let mut head = [0u8; 4];
    read_exact_timed(stream, &mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::Malformed("bad request version"));
    }
    if head[2] != 0x00 {
        return Err(SocksError::Malformed("nonzero reserved byte"));
    }
    if head[1] != CMD_CONNECT {
        write_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(head[1]));
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            read_exact_timed(stream, &mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact_timed(stream, &mut len).await?;
            if len[0] == 0 {
                return Err(SocksError::Malformed("empty domain"));
            }
            let mut name = vec![0u8; len[0] as usize];
            read_exact_timed(stream, &mut name).await?;
            String::from_utf8(name).map_err(|_| SocksError::Malformed("non-utf8 domain"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            read_exact_timed(stream, &mut octets).await?;
            // Canonical grouped-hex form, e.g. 2001:db8::1.
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            write_reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(SocksError::UnsupportedAtyp(other));
        }
    };

    let mut port = [0u8; 2];
    read_exact_timed(stream, &mut port).await?;
    let port = u16::from_be_bytes(port);

    Ok(SocksRequest { host, port })
}

async fn write_reply<S>(stream: &mut S, rep: u8) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    // BND is always 0.0.0.0:0 in IPv4 form.
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Success reply once the upstream channel is open.
pub async fn reply_success<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    write_reply(stream, REP_SUCCESS).await
}

/// General-failure reply when the upstream channel could not be opened.
pub async fn reply_failure<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    write_reply(stream, REP_GENERAL_FAILURE).await
}

/// AsyncRead adapter that counts bytes as they pass through.
pub struct CountingReader<T> {
    inner: T,
    count: Arc<AtomicU64>,
}

impl<T> CountingReader<T> {
    pub fn new(inner: T, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CountingReader<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        let after = buf.filled().len();
        if after > before {
            self.count
                .fetch_add((after - before) as u64, Ordering::Relaxed);
        }
        poll
    }
}

/// FORWARDING: bidirectional copy with live byte accounting.
///
/// `bytes_out` counts client->upstream, `bytes_in` upstream->client. A
/// half-close on either side propagates as a shutdown of the opposite write
/// half; the session ends when both directions finish or either errors.
pub async fn forward<C, U>(
    client: C,
    upstream: U,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
) -> std::io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (client_r, mut client_w) = tokio::io::split(client);
    let (upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let mut client_r = CountingReader::new(client_r, bytes_out);
    let mut upstream_r = CountingReader::new(upstream_r, bytes_in);

    let to_upstream = async {
        let n = tokio::io::copy(&mut client_r, &mut upstream_w).await?;
        let _ = upstream_w.shutdown().await;
        Ok::<u64, std::io::Error>(n)
    };
    let to_client = async {
        let n = tokio::io::copy(&mut upstream_r, &mut client_w).await?;
        let _ = client_w.shutdown().await;
        Ok::<u64, std::io::Error>(n)
    };

    let (sent, received) = tokio::try_join!(to_upstream, to_client)?;
    debug!("socks session closed: {sent} bytes out, {received} bytes in");
    Ok((received, sent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn no_auth_handshake(
        request: &[u8],
    ) -> (Result<SocksRequest, SocksError>, Vec<u8>) {
        let (mut server, mut client) = duplex(1024);

        let mut wire = vec![0x05, 0x01, 0x00];
        wire.extend_from_slice(request);
        client.write_all(&wire).await.unwrap();

        let result = handshake(&mut server, None).await;
        drop(server);

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        (result, replies)
    }

    #[tokio::test]
    async fn connect_ipv4_happy_path() {
        let (result, replies) =
            no_auth_handshake(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50]).await;
        let req = result.unwrap();
        assert_eq!(req.host, "127.0.0.1");
        assert_eq!(req.port, 80);
        // Method selection reply only; success reply is the caller's call.
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn unsupported_command_gets_rep_07() {
        let (result, replies) =
            no_auth_handshake(&[0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50]).await;
        assert!(matches!(result, Err(SocksError::UnsupportedCommand(0x03))));
        assert_eq!(
            replies,
            vec![0x05, 0x00, 0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn unsupported_atyp_gets_rep_08() {
        let (result, replies) = no_auth_handshake(&[0x05, 0x01, 0x00, 0x05, 0, 0]).await;
        assert!(matches!(result, Err(SocksError::UnsupportedAtyp(0x05))));
        assert_eq!(
            replies,
            vec![0x05, 0x00, 0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn ipv6_target_formats_canonically() {
        let mut request = vec![0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&[
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01,
        ]);
        request.extend_from_slice(&0x01bbu16.to_be_bytes());

        let (result, _) = no_auth_handshake(&request).await;
        let req = result.unwrap();
        assert_eq!(req.host, "2001:db8::1");
        assert_eq!(req.port, 443);
    }

    #[tokio::test]
    async fn domain_target_parses() {
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.org");
        request.extend_from_slice(&443u16.to_be_bytes());
        let (result, _) = no_auth_handshake(&request).await;
        let req = result.unwrap();
        assert_eq!(req.host, "example.org");
        assert_eq!(req.port, 443);
    }

    #[tokio::test]
    async fn empty_domain_is_rejected_without_reply() {
        let (result, replies) = no_auth_handshake(&[0x05, 0x01, 0x00, 0x03, 0x00]).await;
        assert!(matches!(result, Err(SocksError::Malformed(_))));
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn auth_required_rejects_plain_greeting() {
        let (mut server, mut client) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let auth = ("x".to_string(), "y".to_string());
        let result = handshake(&mut server, Some(&auth)).await;
        drop(server);

        assert!(matches!(result, Err(SocksError::NoAcceptableMethod)));
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies, vec![0x05, 0xFF]);
    }

    #[tokio::test]
    async fn userpass_auth_success_and_failure() {
        let auth = ("x".to_string(), "y".to_string());

        // Correct credentials: x / y.
        let (mut server, mut client) = duplex(1024);
        let mut wire = vec![0x05, 0x01, 0x02];
        wire.extend_from_slice(&[0x01, 0x01, b'x', 0x01, b'y']);
        wire.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50]);
        client.write_all(&wire).await.unwrap();

        let result = handshake(&mut server, Some(&auth)).await;
        assert!(result.is_ok());
        drop(server);
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(&replies[..4], &[0x05, 0x02, 0x01, 0x00]);

        // Wrong password: x / z.
        let (mut server, mut client) = duplex(1024);
        let mut wire = vec![0x05, 0x01, 0x02];
        wire.extend_from_slice(&[0x01, 0x01, b'x', 0x01, b'z']);
        client.write_all(&wire).await.unwrap();

        let result = handshake(&mut server, Some(&auth)).await;
        assert!(matches!(result, Err(SocksError::AuthFailed)));
        drop(server);
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies, vec![0x05, 0x02, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn reply_bytes_match_wire_format() {
        let (mut server, mut client) = duplex(64);
        reply_success(&mut server).await.unwrap();
        reply_failure(&mut server).await.unwrap();
        drop(server);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(
            out,
            vec![
                0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, //
                0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0,
            ]
        );
    }

    #[tokio::test]
    async fn forward_counts_both_directions() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, mut upstream_far) = duplex(1024);

        let bytes_in = Arc::new(AtomicU64::new(0));
        let bytes_out = Arc::new(AtomicU64::new(0));

        let fwd = tokio::spawn(forward(
            client_near,
            upstream_near,
            bytes_in.clone(),
            bytes_out.clone(),
        ));

        client_far.write_all(b"request bytes").await.unwrap();
        client_far.shutdown().await.unwrap();

        let mut seen = vec![0u8; 13];
        upstream_far.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"request bytes");

        upstream_far.write_all(b"response").await.unwrap();
        upstream_far.shutdown().await.unwrap();

        let mut resp = Vec::new();
        client_far.read_to_end(&mut resp).await.unwrap();
        assert_eq!(resp, b"response");

        let (received, sent) = fwd.await.unwrap().unwrap();
        assert_eq!(sent, 13);
        assert_eq!(received, 8);
        assert_eq!(bytes_out.load(Ordering::Relaxed), 13);
        assert_eq!(bytes_in.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"", b""));
    }
}
