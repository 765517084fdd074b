//! Transport adapter for the upper layer protocol.
//!
//! Connects TCP (optionally TLS-wrapped) streams
//! and moves whole PDUs over them:
//! a receive first reads the fixed 6-byte PDU header,
//! takes the big endian body length from it,
//! then reads exactly that many body bytes before decoding.

use bytes::BytesMut;
use snafu::{ensure, OptionExt, ResultExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::association::{
    ConnectSnafu, ConnectTimeoutSnafu, ConnectionClosedSnafu, ReceivePduSnafu,
    ReceivedPduTooLargeSnafu, Result, SendPduSnafu, WireRecvSnafu, WireSendSnafu,
};
use crate::pdu::{read_pdu, write_pdu, Pdu, PDU_HEADER_SIZE};
use std::time::Duration;

#[cfg(feature = "tls")]
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Open a TCP connection to the given address,
/// bounded by the given timeout.
pub async fn connect<A>(addr: A, timeout: Option<Duration>) -> Result<TcpStream>
where
    A: tokio::net::ToSocketAddrs,
{
    let connecting = TcpStream::connect(addr);
    let stream = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .ok()
            .context(ConnectTimeoutSnafu { timeout })?,
        None => connecting.await,
    }
    .context(ConnectSnafu)?;
    stream.set_nodelay(true).context(ConnectSnafu)?;
    Ok(stream)
}

/// Open a TCP connection to the given address
/// and establish a TLS session over it.
#[cfg(feature = "tls")]
pub async fn connect_tls<A>(
    addr: A,
    timeout: Option<Duration>,
    tls_config: std::sync::Arc<rustls::ClientConfig>,
    server_name: rustls::pki_types::ServerName<'static>,
) -> Result<TlsStream>
where
    A: tokio::net::ToSocketAddrs,
{
    let stream = connect(addr, timeout).await?;
    let connector = tokio_rustls::TlsConnector::from(tls_config);
    connector
        .connect(server_name, stream)
        .await
        .context(ConnectSnafu)
}

/// Read one whole PDU from the stream.
///
/// The given buffer is reused across calls to avoid reallocation.
/// A stream that ends before the PDU header yields
/// [`ConnectionClosed`](crate::association::Error::ConnectionClosed).
pub async fn read_pdu_from_wire<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    max_pdu_length: u32,
) -> Result<Pdu>
where
    S: AsyncRead + Unpin,
{
    buffer.clear();
    buffer.resize(PDU_HEADER_SIZE as usize, 0);
    if let Err(e) = stream.read_exact(&mut buffer[..]).await {
        ensure!(
            e.kind() != std::io::ErrorKind::UnexpectedEof,
            ConnectionClosedSnafu
        );
        return Err(e).context(WireRecvSnafu);
    }

    let pdu_length = u32::from_be_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]);
    ensure!(
        pdu_length <= max_pdu_length,
        ReceivedPduTooLargeSnafu {
            pdu_length,
            max_pdu_length
        }
    );

    buffer.resize((PDU_HEADER_SIZE + pdu_length) as usize, 0);
    stream
        .read_exact(&mut buffer[PDU_HEADER_SIZE as usize..])
        .await
        .context(WireRecvSnafu)?;

    let mut bytes = &buffer[..];
    read_pdu(&mut bytes, max_pdu_length).context(ReceivePduSnafu)
}

/// Encode and send one whole PDU on the stream.
///
/// The given buffer is reused across calls to avoid reallocation.
pub async fn write_pdu_to_wire<S>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    pdu: &Pdu,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    buffer.clear();
    write_pdu(buffer, pdu).context(SendPduSnafu)?;
    stream.write_all(buffer).await.context(WireSendSnafu)
}
