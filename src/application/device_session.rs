// Device session - connection lifecycle, inbound read loop and serialized command issuance
use crate::application::command_encoder::{encode, PulseWidthSequence};
use crate::application::decoder::classify;
use crate::application::line_framer::LineFramer;
use crate::application::parameter_store::ParameterStore;
use crate::application::transport::{Connector, LinkReader, LinkWriter, TransportError};
use crate::domain::command::{PulseWidth, ValidationError, STATUS_TOKEN};
use crate::domain::event::Event;
use crate::domain::parameters::ParameterSnapshot;
use crate::infrastructure::config::SessionSettings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

const READ_LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures collected while tearing a link down. None of them stop the teardown.
#[derive(Debug, Default)]
pub struct CloseReport {
    pub failures: Vec<String>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

type SharedWriter = Arc<Mutex<Box<dyn LinkWriter>>>;

struct ActiveLink {
    generation: u64,
    writer: SharedWriter,
    shutdown: oneshot::Sender<()>,
    read_task: JoinHandle<Option<TransportError>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    store: ParameterStore,
    events: broadcast::Sender<Event>,
    state: watch::Sender<ConnectionState>,
    active: std::sync::Mutex<Option<ActiveLink>>,
    lifecycle: Mutex<()>,
    generation: AtomicU64,
}

/// One device session: owns the link while connected and the parameter store
/// for its whole life.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Shared>,
}

enum ReadExit {
    Cancelled,
    EndOfStream,
    Failed(TransportError),
}

impl DeviceSession {
    pub fn new(connector: Arc<dyn Connector>, settings: SessionSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            inner: Arc::new(Shared {
                connector,
                settings,
                store: ParameterStore::new(),
                events,
                state: watch::Sender::new(ConnectionState::Disconnected),
                active: std::sync::Mutex::new(None),
                lifecycle: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Decoded events as a stream. Events dropped because the consumer lagged are
    /// skipped.
    pub fn event_stream(&self) -> impl Stream<Item = Event> + use<> {
        BroadcastStream::new(self.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Event consumer fell behind: {}", e);
                None
            }
        })
    }

    /// Open the link, start the read loop and schedule the initial status poll.
    pub async fn open(&self) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.active().is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let link = self.inner.connector.open().await.map_err(|e| {
            tracing::error!("Connection to {} failed: {}", self.inner.connector.describe(), e);
            e
        })?;

        // Values from a previous connection may not describe this device.
        self.inner.store.reset();

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let settle_delay = self.inner.settings.settle_delay();

        // Tasks that finish early block on this guard until the link is registered.
        let mut active = self.active();
        let read_task = tokio::spawn(self.clone().read_loop(generation, link.reader, shutdown_rx));
        tokio::spawn(self.clone().initial_poll(generation, settle_delay));
        *active = Some(ActiveLink {
            generation,
            writer: Arc::new(Mutex::new(link.writer)),
            shutdown: shutdown_tx,
            read_task,
        });
        self.inner.state.send_replace(ConnectionState::Connected);
        drop(active);

        tracing::info!("Connected to {}", self.inner.connector.describe());
        Ok(())
    }

    /// Stop the read loop and release both halves of the link.
    ///
    /// Always ends in `Disconnected`; release failures are logged and returned in
    /// the report.
    pub async fn close(&self) -> Result<CloseReport, SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let link = self.take_link(None).ok_or(SessionError::NotConnected)?;
        let report = self.release(link, true).await;
        tracing::info!("Disconnected from {}", self.inner.connector.describe());
        Ok(report)
    }

    /// Send one token as a line.
    pub async fn send_command(&self, token: &str) -> Result<(), SessionError> {
        let frame = encode(token)?;
        let (generation, writer) = self.current_writer()?;
        self.send_frame(generation, writer, &frame).await
    }

    /// Run the two-step pulse width exchange.
    ///
    /// The write half stays locked for the whole sequence, so commands issued
    /// during the gap are written after the value line.
    pub async fn set_pulse_width(&self, ms: f64) -> Result<(), SessionError> {
        let value = PulseWidth::new(ms)?;
        let (generation, writer) = self.current_writer()?;
        let sequence = PulseWidthSequence::new(value, self.inner.settings.pulse_width_gap());

        let result = {
            let mut writer = writer.lock().await;
            let mut result = Ok(());
            for step in sequence {
                if !step.delay.is_zero() {
                    tokio::time::sleep(step.delay).await;
                }
                result = write_frame(&mut **writer, &step.frame).await;
                if result.is_err() {
                    break;
                }
            }
            result
        };
        self.after_write(generation, result).await?;
        tracing::info!("Pulse width set to {} ms", value);
        Ok(())
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_writer(&self) -> Result<(u64, SharedWriter), SessionError> {
        self.active()
            .as_ref()
            .map(|link| (link.generation, link.writer.clone()))
            .ok_or(SessionError::NotConnected)
    }

    /// Writer of the active link, if it is still the link of `generation`.
    fn writer_for(&self, generation: u64) -> Option<SharedWriter> {
        self.active()
            .as_ref()
            .filter(|link| link.generation == generation)
            .map(|link| link.writer.clone())
    }

    async fn send_frame(
        &self,
        generation: u64,
        writer: SharedWriter,
        frame: &[u8],
    ) -> Result<(), SessionError> {
        let result = {
            let mut writer = writer.lock().await;
            write_frame(&mut **writer, frame).await
        };
        self.after_write(generation, result).await
    }

    async fn after_write(
        &self,
        generation: u64,
        result: Result<(), TransportError>,
    ) -> Result<(), SessionError> {
        if let Err(e) = result {
            tracing::error!("Send error: {}", e);
            self.teardown(generation, true).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Unregister the active link (only if it belongs to `generation`, when given).
    ///
    /// The state flips to `Disconnected` under the same guard that clears the link.
    fn take_link(&self, generation: Option<u64>) -> Option<ActiveLink> {
        let mut active = self.active();
        let is_current = active
            .as_ref()
            .is_some_and(|link| generation.is_none_or(|g| g == link.generation));
        if !is_current {
            return None;
        }
        let link = active.take();
        self.inner.state.send_replace(ConnectionState::Disconnected);
        link
    }

    /// Tear down the link of `generation` if it is still the active one.
    async fn teardown(&self, generation: u64, await_reader: bool) {
        if let Some(link) = self.take_link(Some(generation)) {
            let report = self.release(link, await_reader).await;
            tracing::warn!(
                "Link to {} torn down ({} release failures)",
                self.inner.connector.describe(),
                report.failures.len()
            );
        }
    }

    async fn release(&self, mut link: ActiveLink, await_reader: bool) -> CloseReport {
        let mut report = CloseReport::default();

        let _ = link.shutdown.send(());

        if await_reader {
            match tokio::time::timeout(READ_LOOP_STOP_TIMEOUT, &mut link.read_task).await {
                Ok(Ok(None)) => {}
                Ok(Ok(Some(e))) => report.failures.push(e.to_string()),
                Ok(Err(e)) => report.failures.push(format!("read loop failed: {}", e)),
                Err(_) => {
                    link.read_task.abort();
                    report.failures.push("read loop did not stop in time".to_string());
                }
            }
        }

        if let Err(e) = link.writer.lock().await.close().await {
            report.failures.push(e.to_string());
        }

        for failure in &report.failures {
            tracing::warn!("Disconnect error: {}", failure);
        }
        report
    }

    async fn read_loop(
        self,
        generation: u64,
        mut reader: Box<dyn LinkReader>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Option<TransportError> {
        let mut framer = LineFramer::new();

        let exit = loop {
            let chunk = tokio::select! {
                biased;
                _ = &mut shutdown => break ReadExit::Cancelled,
                chunk = reader.read_chunk() => chunk,
            };
            match chunk {
                Ok(Some(bytes)) => {
                    for line in framer.feed(&bytes) {
                        self.dispatch(&line);
                    }
                }
                Ok(None) => break ReadExit::EndOfStream,
                Err(e) => break ReadExit::Failed(e),
            }
        };

        let released = reader.release().await.err();
        if framer.pending_len() > 0 {
            tracing::debug!("Dropping {} bytes of unterminated input", framer.pending_len());
        }

        match exit {
            ReadExit::Cancelled => tracing::debug!("Read loop cancelled"),
            ReadExit::EndOfStream => {
                tracing::info!("Device closed the stream");
                self.teardown(generation, false).await;
            }
            ReadExit::Failed(e) => {
                tracing::error!("Read error: {}", e);
                self.teardown(generation, false).await;
            }
        }
        released
    }

    fn dispatch(&self, line: &str) {
        tracing::debug!(line, "received");
        let event = classify(line);
        if let Event::ParseFailure { raw, reason } = &event {
            tracing::warn!("Failed to parse {:?}: {}", raw, reason);
        }
        self.inner.store.apply_event(&event);
        // Nobody listening is fine; the store still has the update.
        let _ = self.inner.events.send(event);
    }

    /// Ask for a `[STATUS]` report once the device has settled after the open.
    async fn initial_poll(self, generation: u64, settle_delay: Duration) {
        tokio::time::sleep(settle_delay).await;
        let Some(writer) = self.writer_for(generation) else {
            tracing::debug!("Link closed before the initial status poll");
            return;
        };
        let result = match encode(STATUS_TOKEN) {
            Ok(frame) => self.send_frame(generation, writer, &frame).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!("Initial status poll failed: {}", e);
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: LinkWriter + ?Sized,
{
    writer.write_all(frame).await?;
    tracing::debug!(frame = %String::from_utf8_lossy(frame).trim_end(), "sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_transport::MemoryConnector;

    const STATUS_LINE: &[u8] = b"[STATUS]{\"pulseWidth\":2.5,\"peakTime\":1.0,\"holdFreq\":400,\"holdDuty\":50,\"sdAvailable\":true,\"logging\":false}\n";

    fn settings() -> SessionSettings {
        SessionSettings {
            settle_delay_ms: 500,
            pulse_width_gap_ms: 100,
            event_capacity: 64,
        }
    }

    fn session() -> (DeviceSession, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new("bench"));
        (DeviceSession::new(connector.clone(), settings()), connector)
    }

    async fn wait_for_state(session: &DeviceSession, state: ConnectionState) {
        let mut rx = session.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
        // Let the teardown finish releasing the old link.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_twice_is_rejected() {
        let (session, _connector) = session();
        session.open().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(matches!(session.open().await, Err(SessionError::AlreadyConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_is_rejected() {
        let (session, connector) = session();
        assert!(matches!(session.send_command("1").await, Err(SessionError::NotConnected)));
        assert!(matches!(session.set_pulse_width(5.0).await, Err(SessionError::NotConnected)));
        assert!(matches!(session.close().await, Err(SessionError::NotConnected)));
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_stays_disconnected() {
        let (session, connector) = session();
        connector.fail_next_open();
        assert!(matches!(session.open().await, Err(SessionError::Transport(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        session.open().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_status_poll_after_settle_delay() {
        let (session, connector) = session();
        session.open().await.unwrap();
        let device = connector.device().unwrap();

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(device.written().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(device.written(), b"i\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_settle_delay_skips_poll() {
        let (session, connector) = session();
        session.open().await.unwrap();
        let device = connector.device().unwrap();

        let report = session.close().await.unwrap();
        assert!(report.is_clean());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(device.written().is_empty());
        assert!(device.reader_released());
        assert!(device.writer_closed());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_lines_update_store_and_emit_events() {
        let (session, connector) = session();
        let mut events = session.subscribe();
        session.open().await.unwrap();
        let device = connector.device().unwrap();

        device.send(&STATUS_LINE[..40]);
        device.send(&STATUS_LINE[40..]);
        device.send(b"[RESULT]{\"injector\":2,\"peakCurrent\":3.456,\"avgCurrent\":1.2,\"peakHold\":true}\nCurrent pulse width: 4.2 ms\n");

        let Event::Status(status) = events.recv().await.unwrap() else {
            panic!("expected status first");
        };
        assert!(status.sd_available);
        assert!(matches!(events.recv().await.unwrap(), Event::Result(r) if r.injector_id == 2));
        assert_eq!(
            events.recv().await.unwrap(),
            Event::PlainText("Current pulse width: 4.2 ms".to_string())
        );

        let snapshot = session.snapshot();
        assert_eq!(snapshot.pulse_width, "4.2 ms");
        assert_eq!(snapshot.peak_time, "1 ms");
        assert_eq!(snapshot.hold_freq, "400 Hz");
        assert_eq!(snapshot.hold_duty, "50 %");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_status_keeps_loop_running() {
        let (session, connector) = session();
        let mut events = session.subscribe();
        session.open().await.unwrap();
        let device = connector.device().unwrap();

        device.send(b"[STATUS]{not json}\n[LOG]still here\n");
        assert!(matches!(events.recv().await.unwrap(), Event::ParseFailure { .. }));
        assert_eq!(events.recv().await.unwrap(), Event::LogText("still here".to_string()));
        assert_eq!(session.snapshot(), ParameterSnapshot::default());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_width_sequence_timing() {
        let (session, connector) = session();
        session.open().await.unwrap();
        let device = connector.device().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        device.take_written();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.set_pulse_width(2.5).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(device.written(), b"p\n");

        task.await.unwrap().unwrap();
        assert_eq!(device.take_written(), b"p\n2.5\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_during_gap_waits_for_value() {
        let (session, connector) = session();
        session.open().await.unwrap();
        let device = connector.device().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        device.take_written();

        let sequence = tokio::spawn({
            let session = session.clone();
            async move { session.set_pulse_width(100.0).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.send_command("1").await.unwrap();
        sequence.await.unwrap().unwrap();

        assert_eq!(device.take_written(), b"p\n100\n1\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_pulse_width_sends_nothing() {
        let (session, connector) = session();
        session.open().await.unwrap();
        let device = connector.device().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        device.take_written();

        for ms in [0.09, 100.1, f64::NAN] {
            assert!(matches!(
                session.set_pulse_width(ms).await,
                Err(SessionError::Validation(ValidationError::PulseWidthOutOfRange(_)))
            ));
        }
        session.set_pulse_width(0.1).await.unwrap();
        assert_eq!(device.take_written(), b"p\n0.1\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_command_is_rejected() {
        let (session, connector) = session();
        session.open().await.unwrap();
        assert!(matches!(
            session.send_command("   ").await,
            Err(SessionError::Validation(ValidationError::EmptyCommand))
        ));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(connector.device().unwrap().written(), b"i\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_tears_down() {
        let (session, connector) = session();
        session.open().await.unwrap();
        let device = connector.device().unwrap();

        device.hang_up();
        wait_for_state(&session, ConnectionState::Disconnected).await;
        assert!(device.reader_released());
        assert!(device.writer_closed());
        assert!(matches!(session.send_command("i").await, Err(SessionError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_tears_down() {
        let (session, connector) = session();
        session.open().await.unwrap();
        connector.device().unwrap().fail_read();
        wait_for_state(&session, ConnectionState::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_tears_down() {
        let (session, connector) = session();
        session.open().await.unwrap();
        let device = connector.device().unwrap();
        device.fail_writes();

        assert!(matches!(session.send_command("1").await, Err(SessionError::Transport(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(device.reader_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_during_pending_teardown_stays_connected() {
        let (session, connector) = session();
        session.open().await.unwrap();
        let old_device = connector.device().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        old_device.take_written();

        // Holds the old write half through the gap, so its teardown waits.
        let sequence = tokio::spawn({
            let session = session.clone();
            async move { session.set_pulse_width(5.0).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        old_device.hang_up();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(session.send_command("i").await, Err(SessionError::NotConnected)));
        assert!(!old_device.writer_closed());

        session.open().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);

        let _ = sequence.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(old_device.writer_closed());
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(matches!(session.open().await, Err(SessionError::AlreadyConnected)));

        let new_device = connector.device().unwrap();
        session.send_command("1").await.unwrap();
        assert_eq!(new_device.written(), b"1\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_release_failures() {
        let (session, connector) = session();
        session.open().await.unwrap();
        connector.device().unwrap().fail_close();

        let report = session.close().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_survives_disconnect_and_resets_on_reconnect() {
        let (session, connector) = session();
        let mut events = session.subscribe();
        session.open().await.unwrap();
        connector.device().unwrap().send(STATUS_LINE);
        events.recv().await.unwrap();

        session.close().await.unwrap();
        assert_eq!(session.snapshot().pulse_width, "2.5 ms");

        session.open().await.unwrap();
        assert_eq!(session.snapshot(), ParameterSnapshot::default());
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_yields_events() {
        let (session, connector) = session();
        let stream = session.event_stream();
        tokio::pin!(stream);
        session.open().await.unwrap();
        connector.device().unwrap().send(b"[ERROR]SD card not available!\n");

        assert_eq!(
            stream.next().await,
            Some(Event::ErrorText("SD card not available!".to_string()))
        );
    }
}
