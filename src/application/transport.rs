// Transport traits - the byte link to the device, split into read and write halves
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("close failed: {0}")]
    Close(String),
    #[error("link closed")]
    Closed,
}

/// Opened link; each half has exactly one owner.
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

#[async_trait]
pub trait LinkReader: Send {
    /// Wait for the next chunk. `Ok(None)` signals end of stream.
    ///
    /// Must be cancel safe: dropping the future loses no data.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Give up the read half.
    async fn release(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait LinkWriter: Send {
    async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Flush and give up the write half.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens links to a device.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Link, TransportError>;

    /// Human-readable name of the endpoint, for logs.
    fn describe(&self) -> String;
}
