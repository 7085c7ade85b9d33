use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub type FrameReader = Box<dyn AsyncRead + Send + Unpin>;
pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte stream to the remote endpoint, split into halves
pub struct TransportStream {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    /// Human-readable peer description for logs
    pub peer: String,
}

impl TransportStream {
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
        }
    }
}

/// Opens transport streams to one endpoint. The pool calls this whenever it
/// needs a new connection.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Endpoint description for logs and errors
    fn endpoint(&self) -> String;

    async fn connect(&self) -> io::Result<TransportStream>;
}

/// Plain TCP connector
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> io::Result<TransportStream> {
        let address = self.endpoint();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", address),
                )
            })??;
        stream.set_nodelay(true)?;

        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or(address);
        let (reader, writer) = stream.into_split();
        Ok(TransportStream::new(reader, writer, peer))
    }
}
