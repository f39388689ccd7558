//! Node addressing and the byte streams peer RPCs travel over.
//!
//! A node is reached through a *connection string*: `http://host:port` for
//! TCP or `unix:///path/to/socket` for a Unix domain socket. Encoding a
//! human supplied listen address into a connection string and decoding it
//! back are pure functions; [`Listener`] and [`connect`] do the actual I/O.

use crate::errors::StoreError;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tonic::transport::server::Connected;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

const TCP_SCHEME: &str = "http://";
const UNIX_SCHEME: &str = "unix://";

/// Decoded connection string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// TCP authority (`host:port`).
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

/// Encodes a listen address (`host:port`, `:port` or a socket path) as a
/// connection string.
pub fn encode(listen: &str) -> Result<String, StoreError> {
    let listen = listen.trim();
    if let Some(path) = listen.strip_prefix(UNIX_SCHEME) {
        return encode_path(path, listen);
    }
    if is_socket_path(listen) {
        return encode_path(listen, listen);
    }
    let authority = listen.strip_prefix(TCP_SCHEME).unwrap_or(listen);
    let (host, port) = split_authority(authority)?;
    Ok(format!("{}{}:{}", TCP_SCHEME, host, port))
}

/// Decodes a connection string produced by [`encode`].
pub fn decode(connection_string: &str) -> Result<Address, StoreError> {
    if let Some(path) = connection_string.strip_prefix(UNIX_SCHEME) {
        if path.is_empty() {
            return Err(StoreError::InvalidAddress(connection_string.to_string()));
        }
        return Ok(Address::Unix(PathBuf::from(path)));
    }
    if let Some(authority) = connection_string.strip_prefix(TCP_SCHEME) {
        let (host, port) = split_authority(authority)?;
        return Ok(Address::Tcp(format!("{}:{}", host, port)));
    }
    Err(StoreError::InvalidAddress(connection_string.to_string()))
}

fn encode_path(path: &str, original: &str) -> Result<String, StoreError> {
    if path.is_empty() {
        return Err(StoreError::InvalidAddress(original.to_string()));
    }
    Ok(format!("{}{}", UNIX_SCHEME, path))
}

fn is_socket_path(listen: &str) -> bool {
    listen.starts_with('/')
        || listen.starts_with("./")
        || listen.starts_with("../")
        || listen.ends_with(".sock")
}

fn split_authority(authority: &str) -> Result<(&str, u16), StoreError> {
    let invalid = || StoreError::InvalidAddress(authority.to_string());
    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.contains('/') {
        return Err(invalid());
    }
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok((host, port))
}

/// Opens a gRPC channel to the node at `connection_string`.
pub async fn connect(connection_string: &str) -> Result<Channel, StoreError> {
    match decode(connection_string)? {
        Address::Tcp(authority) => {
            let endpoint = Endpoint::from_shared(format!("{}{}", TCP_SCHEME, authority))
                .map_err(|_| StoreError::InvalidAddress(connection_string.to_string()))?;
            Ok(endpoint.connect().await?)
        }
        Address::Unix(path) => {
            // The URI is required by the HTTP/2 layer but never dialed.
            let channel = Endpoint::from_static("http://[::]:50051")
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move { UnixStream::connect(path).await }
                }))
                .await?;
            Ok(channel)
        }
    }
}

/// Listening socket for the peer RPC server.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener and its path.
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Binds `listen`, a TCP address or a socket path.
    pub async fn bind(listen: &str) -> Result<Self, StoreError> {
        match decode(&encode(listen)?)? {
            Address::Tcp(authority) => Ok(Listener::Tcp(TcpListener::bind(authority).await?)),
            Address::Unix(path) => {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let listener = UnixListener::bind(&path)?;
                Ok(Listener::Unix(listener, path))
            }
        }
    }

    /// Connection string other nodes use to reach this listener.
    pub fn connection_string(&self) -> Result<String, StoreError> {
        match self {
            Listener::Tcp(listener) => encode(&listener.local_addr()?.to_string()),
            Listener::Unix(_, path) => encode_path(&path.to_string_lossy(), ""),
        }
    }

    async fn accept(&self) -> io::Result<RpcStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(RpcStream::Tcp(stream))
            }
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(RpcStream::Unix(stream))
            }
        }
    }

    /// Turns the listener into a stream of accepted connections.
    pub fn incoming(self) -> BoxStream<'static, io::Result<RpcStream>> {
        stream::unfold(self, |listener| async move {
            let conn = listener.accept().await;
            Some((conn, listener))
        })
        .boxed()
    }
}

/// Accepted peer connection.
#[derive(Debug)]
pub enum RpcStream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix domain socket connection.
    Unix(UnixStream),
}

impl Connected for RpcStream {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

impl AsyncRead for RpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RpcStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            RpcStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RpcStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            RpcStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RpcStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            RpcStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RpcStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            RpcStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_tcp_addresses() {
        assert_eq!(encode("127.0.0.1:4000").unwrap(), "http://127.0.0.1:4000");
        assert_eq!(encode(":4000").unwrap(), "http://127.0.0.1:4000");
        assert_eq!(encode("localhost:80").unwrap(), "http://localhost:80");
        assert_eq!(encode("[::1]:9000").unwrap(), "http://[::1]:9000");
        assert_eq!(
            encode("http://10.0.0.1:4000").unwrap(),
            "http://10.0.0.1:4000"
        );
    }

    #[test]
    fn encodes_socket_paths() {
        assert_eq!(
            encode("/tmp/node1/raft.sock").unwrap(),
            "unix:///tmp/node1/raft.sock"
        );
        assert_eq!(encode("./node.sock").unwrap(), "unix://./node.sock");
        assert_eq!(encode("node.sock").unwrap(), "unix://node.sock");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(encode("").is_err());
        assert!(encode("localhost").is_err());
        assert!(encode("localhost:http").is_err());
        assert!(encode("localhost:70000").is_err());
        assert!(decode("tcp://127.0.0.1:4000").is_err());
        assert!(decode("unix://").is_err());
    }

    #[test]
    fn decodes_what_encode_produces() {
        let tcp = encode("127.0.0.1:4000").unwrap();
        assert_eq!(
            decode(&tcp).unwrap(),
            Address::Tcp("127.0.0.1:4000".to_string())
        );
        let unix = encode("/var/run/sqlcluster.sock").unwrap();
        assert_eq!(
            decode(&unix).unwrap(),
            Address::Unix(PathBuf::from("/var/run/sqlcluster.sock"))
        );
    }
}
