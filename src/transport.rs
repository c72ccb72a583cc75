//! Connection lifecycle and complete-packet reads.
//!
//! FESL and Theater share the same two-phase read discipline (header,
//! then body by indicated length) and the same per-iteration progress
//! timeout; they differ only in how the underlying stream is obtained.
//! [`Transport`] is generic over the stream type so both share one
//! implementation; [`dial_theater`]/[`dial_fesl`] are the two
//! connect-time entry points.

use std::time::Duration;

use blaze_ssl_async::BlazeStream;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::constants::HEADER_LENGTH;
use crate::error::{Error, Result};

/// A single connection plus its read/write timeout. Reads proceed
/// header-first, then body-by-indicated-length; see module docs.
pub struct Transport<S> {
    stream: S,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        Transport { stream, timeout }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        trace!("wrote {} bytes", bytes.len());
        #[cfg(feature = "large-packet-logging")]
        trace!("wrote body: {}", String::from_utf8_lossy(bytes));
        Ok(())
    }

    /// Reads one complete packet: the fixed 12-byte header, then exactly
    /// `indicated_length - 12` body bytes. Each call to the underlying
    /// stream resets the progress deadline; a stalled connection (no
    /// bytes at all within `timeout`) surfaces as [`Error::Timeout`].
    pub async fn read_packet(&mut self, indicated_body_length: impl Fn(&[u8; HEADER_LENGTH]) -> Result<usize>) -> Result<([u8; HEADER_LENGTH], Vec<u8>)> {
        let mut header = [0u8; HEADER_LENGTH];
        self.read_exact_with_progress_timeout(&mut header).await?;

        let body_len = indicated_body_length(&header)?;
        let mut body = vec![0u8; body_len];
        self.read_exact_with_progress_timeout(&mut body).await?;

        debug!("read packet ({} header bytes, {} body bytes)", header.len(), body.len());
        #[cfg(feature = "large-packet-logging")]
        trace!("read body: {}", String::from_utf8_lossy(&body));
        Ok((header, body))
    }

    /// `read_exact`, but re-armed per underlying read rather than bounding
    /// the whole call — a large multi-packet response can legitimately
    /// take longer than `timeout` as long as bytes keep arriving.
    async fn read_exact_with_progress_timeout(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = tokio::time::timeout(self.timeout, self.stream.read(&mut buf[filled..])).await??;
            if n == 0 {
                return Err(Error::Connection("connection closed by peer".to_string()));
            }
            filled += n;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Plaintext Theater connection: resolve, open the socket with
/// `SO_KEEPALIVE`, connect within `timeout`.
pub async fn dial_theater(host: &str, port: u16, timeout: Duration) -> Result<Transport<TcpStream>> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Timeout)??;
    configure_keepalive(&stream)?;
    debug!("connected to Theater backend {host}:{port}");
    Ok(Transport::new(stream, timeout))
}

/// TLS-wrapped FESL connection, using the legacy cipher list these
/// backends require (`:HIGH:!DH:!aNULL`, minimum TLSv1, no certificate
/// verification) via `blaze-ssl-async`'s `BlazeStream`.
pub async fn dial_fesl(host: &str, port: u16, timeout: Duration) -> Result<Transport<BlazeStream>> {
    let stream = tokio::time::timeout(timeout, BlazeStream::connect((host.to_string(), port)))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|err| Error::Connection(format!("TLS connect to {host}:{port} failed: {err}")))?;
    debug!("connected to FESL backend {host}:{port}");
    Ok(Transport::new(stream, timeout))
}

fn configure_keepalive(stream: &TcpStream) -> Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
    sock_ref.set_keepalive(true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn read_packet_respects_indicated_length() {
        let (mut client, server) = duplex(64);
        let mut transport = Transport::new(server, Duration::from_secs(1));

        let mut packet = Vec::new();
        packet.extend_from_slice(b"fsys");
        packet.push(0xC0);
        packet.extend_from_slice(&[0, 0, 0]);
        packet.extend_from_slice(&20u32.to_be_bytes());
        packet.extend_from_slice(b"TXN=Ping\n\x00");
        client.write_all(&packet).await.unwrap();

        let (header, body) = transport
            .read_packet(|h| Ok(u32::from_be_bytes([h[8], h[9], h[10], h[11]]) as usize - HEADER_LENGTH))
            .await
            .unwrap();
        assert_eq!(&header[0..4], b"fsys");
        assert_eq!(body, b"TXN=Ping\n\x00");
    }

    #[tokio::test]
    async fn timeout_on_stalled_connection() {
        let (client, server) = duplex(64);
        let mut transport = Transport::new(server, Duration::from_millis(20));
        let _keep_open = client;

        let result = transport.read_packet(|_| Ok(1)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
