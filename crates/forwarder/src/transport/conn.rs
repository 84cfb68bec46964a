//! Persistent DNS connections.
//!
//! One [`PersistConn`] is a live socket plus the time it was last used.
//! While idle it sits in exactly one pool bucket owned by the transport
//! manager; during an exchange it is owned by that exchange alone.

use dnsteer_domain::WireKind;
use std::io;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;

/// DNS over TCP caps messages at a u16 length prefix.
const MAX_STREAM_MESSAGE_SIZE: usize = 65_535;

pub enum DnsConn {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DnsConn {
    pub fn kind(&self) -> WireKind {
        match self {
            Self::Udp(_) => WireKind::Udp,
            Self::Tcp(_) => WireKind::Tcp,
            Self::Tls(_) => WireKind::Tls,
        }
    }

    pub async fn send_msg(&mut self, message: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp(socket) => {
                socket.send(message).await?;
                Ok(())
            }
            Self::Tcp(stream) => send_with_length_prefix(stream, message).await,
            Self::Tls(stream) => send_with_length_prefix(stream.as_mut(), message).await,
        }
    }

    /// Receives one DNS message. `udp_size` bounds the datagram buffer for
    /// UDP; stream transports are framed by their length prefix.
    pub async fn recv_msg(&mut self, udp_size: u16) -> io::Result<Vec<u8>> {
        match self {
            Self::Udp(socket) => {
                let mut buf = vec![0u8; udp_size as usize];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
            Self::Tcp(stream) => read_with_length_prefix(stream).await,
            Self::Tls(stream) => read_with_length_prefix(stream.as_mut()).await,
        }
    }
}

pub struct PersistConn {
    pub conn: DnsConn,
    pub used: Instant,
}

impl PersistConn {
    pub fn new(conn: DnsConn) -> Self {
        Self {
            conn,
            used: Instant::now(),
        }
    }
}

/// True for the error class a remote close of a kept-alive connection
/// produces. Used to distinguish a stale cached connection (retry with a
/// fresh one) from a genuinely failing host.
pub fn is_remote_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

pub(crate) async fn send_with_length_prefix<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let length = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS message too large"))?;
    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(message).await?;
    stream.flush().await
}

pub(crate) async fn read_with_length_prefix<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;

    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len > MAX_STREAM_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "response length exceeds DNS stream limit",
        ));
    }

    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}
