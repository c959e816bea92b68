// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The actual wire-level connections a [`super::Transport`] pools: a plain
//! UDP socket, a plain TCP stream, or a TLS-over-TCP stream. Writing a query
//! and reading a response is unified behind [`Connection`] so the owner
//! task and the dispatch loop never have to branch on protocol themselves.

use crate::wire::MAX_LEN;
use bytes::{Bytes, BytesMut};
use domain::base::Message;
use std::{fmt, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::timeout,
};

#[cfg(feature = "dot-rustls")]
use {
    once_cell::sync::OnceCell,
    rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName},
    socket2::{Socket, TcpKeepalive},
    std::sync::Arc,
    tokio_rustls::{client::TlsStream, TlsConnector},
};

/// Dial timeout applied to every fresh connection attempt, matching the
/// reference design's `dialTimeout`.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(4);

/// The three upstream transports a pool can hold connections for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain UDP, one datagram per exchange.
    Udp,
    /// Plain TCP, length-prefixed framing.
    Tcp,
    /// TLS over TCP, length-prefixed framing over the decrypted stream.
    TcpTls,
}

impl Protocol {
    /// The tag used in logs and in configuration, matching the reference
    /// design's bucket keys (`"udp"`, `"tcp"`, `"tcp-tls"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::TcpTls => "tcp-tls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A TLS client configuration together with the server name used for SNI
/// and certificate verification. Cheap to clone: the `ClientConfig` itself
/// is held behind an `Arc`.
#[cfg(feature = "dot-rustls")]
#[derive(Clone)]
pub struct TlsSetting {
    pub config: Arc<ClientConfig>,
    pub server_name: String,
}

#[cfg(feature = "dot-rustls")]
impl TlsSetting {
    /// Build a setting with webpki's bundled root store and the given SNI
    /// server name. Certificate material (client certs) beyond the default
    /// root store is out of scope for this core; it is loaded once by the
    /// `tls` directive and handed to proxies as an already-built
    /// `ClientConfig` when the caller needs more than this default.
    pub fn with_webpki_roots(server_name: String) -> Self {
        static DEFAULT: OnceCell<Arc<ClientConfig>> = OnceCell::new();
        let config = DEFAULT
            .get_or_init(|| {
                let mut roots = RootCertStore::empty();
                roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
                    OwnedTrustAnchor::from_subject_spki_name_constraints(
                        ta.subject,
                        ta.spki,
                        ta.name_constraints,
                    )
                }));
                Arc::new(
                    ClientConfig::builder()
                        .with_safe_defaults()
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .clone();
        Self { config, server_name }
    }
}

/// Stand-in for [`TlsSetting`] when the crate is built without
/// `dot-rustls`, so `Connection::dial`'s signature doesn't need to be
/// duplicated per feature combination. Never constructible.
#[cfg(not(feature = "dot-rustls"))]
pub enum TlsSetting {}

/// A live connection to one upstream, owned either by the pool (while idle)
/// or by the caller performing an exchange.
pub enum Connection {
    Udp(UdpSocket),
    Tcp(TcpStream),
    #[cfg(feature = "dot-rustls")]
    TcpTls(TlsStream<TcpStream>),
}

impl Connection {
    /// Opens a fresh connection to `addr` for `proto`, applying the dial
    /// timeout. For `tcp-tls` this also performs the TLS handshake.
    pub async fn dial(
        proto: Protocol,
        addr: SocketAddr,
        #[cfg_attr(not(feature = "dot-rustls"), allow(unused_variables))] tls: Option<&TlsSetting>,
    ) -> std::io::Result<Self> {
        timeout(DIAL_TIMEOUT, Self::dial_inner(proto, addr, tls))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out")
            })?
    }

    async fn dial_inner(
        proto: Protocol,
        addr: SocketAddr,
        #[cfg_attr(not(feature = "dot-rustls"), allow(unused_variables))] tls: Option<&TlsSetting>,
    ) -> std::io::Result<Self> {
        match proto {
            Protocol::Udp => {
                let bind_addr: SocketAddr = if addr.is_ipv4() {
                    ([0u8; 4], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(bind_addr).await?;
                socket.connect(addr).await?;
                Ok(Self::Udp(socket))
            }
            Protocol::Tcp => Ok(Self::Tcp(Self::connect_tcp(addr).await?)),
            #[cfg(feature = "dot-rustls")]
            Protocol::TcpTls => {
                let tls = tls.ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "tcp-tls dial requested without a TLS configuration",
                    )
                })?;
                let stream = Self::connect_tcp(addr).await?;
                let server_name = ServerName::try_from(tls.server_name.as_str()).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid server name")
                })?;
                let connector = TlsConnector::from(tls.config.clone());
                let stream = connector.connect(server_name, stream).await?;
                Ok(Self::TcpTls(stream))
            }
            #[cfg(not(feature = "dot-rustls"))]
            Protocol::TcpTls => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "built without dot-rustls support",
            )),
        }
    }

    #[cfg(feature = "dot-rustls")]
    async fn connect_tcp(addr: SocketAddr) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        // TCP keepalive doesn't help us pool our connections, sadly, but a
        // middlebox between us and the upstream may still appreciate it.
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
        let socket: Socket = stream.into_std()?.into();
        socket.set_tcp_keepalive(&keepalive)?;
        TcpStream::from_std(socket.into())
    }

    #[cfg(not(feature = "dot-rustls"))]
    async fn connect_tcp(addr: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }

    /// The protocol tag of this connection, used to return it to the right
    /// bucket on yield.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Udp(_) => Protocol::Udp,
            Self::Tcp(_) => Protocol::Tcp,
            #[cfg(feature = "dot-rustls")]
            Self::TcpTls(_) => Protocol::TcpTls,
        }
    }

    /// Writes `msg` and reads back a single, matching response, applying
    /// `deadline` to the write and read independently (as the reference
    /// design does with a 2s write deadline and a 2s read deadline).
    pub async fn exchange(
        &mut self,
        msg: &Message<Bytes>,
        deadline: Duration,
    ) -> std::io::Result<Message<Bytes>> {
        timeout(deadline, self.write(msg))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline"))??;
        timeout(deadline, self.read())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read deadline"))?
    }

    async fn write(&mut self, msg: &Message<Bytes>) -> std::io::Result<()> {
        match self {
            Self::Udp(sock) => {
                sock.send(msg.as_slice()).await?;
            }
            Self::Tcp(stream) => write_framed(stream, msg).await?,
            #[cfg(feature = "dot-rustls")]
            Self::TcpTls(stream) => write_framed(stream, msg).await?,
        }
        Ok(())
    }

    async fn read(&mut self) -> std::io::Result<Message<Bytes>> {
        match self {
            Self::Udp(sock) => {
                let mut buf = BytesMut::with_capacity(MAX_LEN);
                buf.resize(MAX_LEN, 0);
                let len = sock.recv(&mut buf).await?;
                buf.truncate(len);
                parse_or_garbage(buf.freeze())
            }
            Self::Tcp(stream) => read_framed(stream).await,
            #[cfg(feature = "dot-rustls")]
            Self::TcpTls(stream) => read_framed(stream).await,
        }
    }
}

async fn write_framed<S: tokio::io::AsyncWrite + Unpin>(
    stream: &mut S,
    msg: &Message<Bytes>,
) -> std::io::Result<()> {
    let payload = msg.as_slice();
    let len = u16::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "message too long"))?
        .to_be_bytes();
    let mut framed = BytesMut::with_capacity(2 + payload.len());
    framed.extend_from_slice(&len);
    framed.extend_from_slice(payload);
    stream.write_all(&framed).await?;
    stream.flush().await
}

async fn read_framed<S: tokio::io::AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<Message<Bytes>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = BytesMut::with_capacity(len);
    buf.resize(len, 0);
    stream.read_exact(&mut buf).await?;
    parse_or_garbage(buf.freeze())
}

fn parse_or_garbage(buf: Bytes) -> std::io::Result<Message<Bytes>> {
    Message::from_octets(buf)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed DNS message"))
}
