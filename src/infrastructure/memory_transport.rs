// In-memory transport - a scripted device end for tests and offline runs
use crate::application::transport::{Connector, Link, LinkReader, LinkWriter, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

enum Inbound {
    Data(Bytes),
    Fail(io::ErrorKind),
    Eof,
}

#[derive(Default)]
struct DeviceState {
    written: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_close: AtomicBool,
    reader_released: AtomicBool,
    writer_closed: AtomicBool,
}

/// Hands out a fresh in-memory link on every open and keeps the device end of
/// the latest one.
pub struct MemoryConnector {
    name: String,
    fail_next_open: AtomicBool,
    opens: AtomicUsize,
    device: Mutex<Option<DeviceEnd>>,
}

impl MemoryConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_next_open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            device: Mutex::new(None),
        }
    }

    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Device end of the most recently opened link.
    pub fn device(&self) -> Option<DeviceEnd> {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Open {
                port: self.name.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
            });
        }

        let (to_host, from_device) = mpsc::unbounded_channel();
        let state = Arc::new(DeviceState::default());
        let device = DeviceEnd {
            to_host,
            state: state.clone(),
        };
        *self.device.lock().unwrap_or_else(PoisonError::into_inner) = Some(device);
        self.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Link {
            reader: Box::new(MemoryReader {
                rx: from_device,
                state: state.clone(),
            }),
            writer: Box::new(MemoryWriter {
                state,
                closed: false,
            }),
        })
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}

/// The device side of an in-memory link.
#[derive(Clone)]
pub struct DeviceEnd {
    to_host: mpsc::UnboundedSender<Inbound>,
    state: Arc<DeviceState>,
}

impl DeviceEnd {
    /// Deliver raw bytes to the host. Returns false once the host released the link.
    pub fn send(&self, bytes: &[u8]) -> bool {
        self.to_host
            .send(Inbound::Data(Bytes::copy_from_slice(bytes)))
            .is_ok()
    }

    pub fn send_line(&self, line: &str) -> bool {
        self.send(format!("{}\n", line).as_bytes())
    }

    /// End the stream, as if the cable was pulled.
    pub fn hang_up(&self) {
        let _ = self.to_host.send(Inbound::Eof);
    }

    pub fn fail_read(&self) {
        let _ = self.to_host.send(Inbound::Fail(io::ErrorKind::BrokenPipe));
    }

    pub fn fail_writes(&self) {
        self.state.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.state.fail_close.store(true, Ordering::SeqCst);
    }

    /// Everything the host wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.written_buf().clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written_buf())
    }

    pub fn reader_released(&self) -> bool {
        self.state.reader_released.load(Ordering::SeqCst)
    }

    pub fn writer_closed(&self) -> bool {
        self.state.writer_closed.load(Ordering::SeqCst)
    }

    fn written_buf(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.state
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Inbound>,
    state: Arc<DeviceState>,
}

#[async_trait]
impl LinkReader for MemoryReader {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.rx.recv().await {
            Some(Inbound::Data(bytes)) => Ok(Some(bytes)),
            Some(Inbound::Fail(kind)) => Err(TransportError::Read(io::Error::new(
                kind,
                "simulated read failure",
            ))),
            Some(Inbound::Eof) | None => Ok(None),
        }
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        self.state.reader_released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryWriter {
    state: Arc<DeviceState>,
    closed: bool,
}

#[async_trait]
impl LinkWriter for MemoryWriter {
    async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        self.state
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.state.writer_closed.store(true, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Close("simulated close failure".to_string()));
        }
        Ok(())
    }
}
