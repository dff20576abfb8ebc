// Serial port transport - the device link over a real serial port
use crate::application::transport::{Connector, Link, LinkReader, LinkWriter, TransportError};
use crate::infrastructure::config::SerialSettings;
use async_trait::async_trait;
use bytes::Bytes;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 256;
const CHUNK_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct SerialConnector {
    settings: SerialSettings,
}

impl SerialConnector {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        let open_error = |source: serialport::Error| TransportError::Open {
            port: self.settings.port.clone(),
            source: source.into(),
        };

        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.settings.read_timeout())
            .open()
            .map_err(open_error)?;
        let read_half = port.try_clone().map_err(open_error)?;

        tracing::debug!(
            "Opened {} at {} baud",
            self.settings.port,
            self.settings.baud_rate
        );

        Ok(Link {
            reader: Box::new(SerialReader::spawn(read_half)),
            writer: Box::new(SerialWriter { port: Some(port) }),
        })
    }

    fn describe(&self) -> String {
        format!("{} @ {}", self.settings.port, self.settings.baud_rate)
    }
}

/// List the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|source| TransportError::Open {
            port: "*".to_string(),
            source: source.into(),
        })
}

/// The serial read half. A blocking thread polls the port and queues chunks;
/// `read_chunk` only waits on the queue, so dropping it mid-wait loses nothing.
struct SerialReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SerialReader {
    fn spawn<P>(mut port: P) -> Self
    where
        P: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let thread = std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            while !thread_stop.load(Ordering::SeqCst) {
                match port.read(&mut buf) {
                    // Port gone; dropping the sender ends the stream.
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        Self {
            rx,
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        // An aborted read task never reaches `release`; the thread still has to
        // let go of its port handle.
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkReader for SerialReader {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(TransportError::Read(e)),
            None => Ok(None),
        }
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::SeqCst);
        self.rx.close();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        // Exits within one read timeout.
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| TransportError::Close(e.to_string()))?
            .map_err(|_| TransportError::Close("serial reader thread panicked".to_string()))
    }
}

/// The serial write half. Writes block until the driver accepts the bytes (or
/// the port timeout hits), so they run on the blocking pool.
struct SerialWriter<P> {
    port: Option<P>,
}

impl<P> SerialWriter<P>
where
    P: Write + Send + 'static,
{
    /// Run `op` on the port off the async runtime. The port is put back unless
    /// the blocking task itself died.
    async fn with_port<F>(&mut self, op: F) -> Result<io::Result<()>, TransportError>
    where
        F: FnOnce(&mut P) -> io::Result<()> + Send + 'static,
    {
        let mut port = self.port.take().ok_or(TransportError::Closed)?;
        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut port);
            (port, result)
        })
        .await
        .map_err(|e| TransportError::Write(io::Error::other(e)))?;
        self.port = Some(port);
        Ok(result)
    }
}

#[async_trait]
impl<P> LinkWriter for SerialWriter<P>
where
    P: Write + Send + 'static,
{
    async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let frame = frame.to_vec();
        self.with_port(move |port| {
            port.write_all(&frame)?;
            port.flush()
        })
        .await?
        .map_err(TransportError::Write)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.port.is_none() {
            return Ok(());
        }
        let flushed = self.with_port(|port| port.flush()).await;
        // Dropping the handle closes the port.
        self.port = None;
        flushed?.map_err(|e| TransportError::Close(e.to_string()))
    }
}
