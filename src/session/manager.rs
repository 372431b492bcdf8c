//! Session connection manager
//!
//! A single actor task owns every piece of session state: the connection
//! state machine, the current transport, the pipelines bound to it and the
//! reconnect timer. Host commands, transport events and timer fires all
//! arrive on one channel and are handled in order, each to completion, so a
//! closure can never interleave with a half-done state change.
//!
//! Every transport gets a new generation number. Events, connect results and
//! tool results carry the generation that produced them and are dropped once
//! the session has moved on.

use super::fsm::{Action, Closure, ConnectionFsm, SessionStatus};
use super::link::SessionLink;
use crate::audio::{AudioClock, AudioOutput, CapturePipeline, MicrophoneSource, PlaybackPipeline, SystemClock};
use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use crate::protocol::{BidiGenerateContentSetup, ClientMessage, FunctionDeclaration, ServerEvent, Transcript};
use crate::tools::{CapabilityRegistry, Dispatcher, ToolCall, ToolResult};
use crate::transport::{CloseKind, Closer, Connection, Connector, TransportEvent};
use crate::video::{FrameSettings, VideoSource, VideoStreamer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    /// An error closure scheduled retry `attempt` after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal failure; a new `connect()` is required
    Failed(String),
    InputTranscript(Transcript),
    OutputTranscript(Transcript),
    Text(String),
    /// The user barged in and playback was cut
    Interrupted,
    TurnComplete,
    ToolCallsCancelled(Vec<String>),
    /// Results could not be delivered; these error results were synthesized instead
    ToolBatchFailed(Vec<ToolResult>),
    /// The model finished generating this turn; playback may still be draining
    GenerationComplete,
    /// Playback level sample for visualization: overall RMS plus per-band magnitudes
    Level { rms: f32, bands: Vec<f32> },
}

/// Media devices a session binds to. Absent devices are simply not used.
#[derive(Clone)]
pub struct MediaDevices {
    pub microphone: Option<Arc<dyn MicrophoneSource>>,
    pub speaker: Option<Arc<dyn AudioOutput>>,
    pub video: Option<Arc<dyn VideoSource>>,
    pub clock: Arc<dyn AudioClock>,
}

impl Default for MediaDevices {
    fn default() -> Self {
        Self {
            microphone: None,
            speaker: None,
            video: None,
            clock: Arc::new(SystemClock::new()),
        }
    }
}

enum Message {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Opened { generation: u64, result: Result<Opened> },
    Transport { generation: u64, event: TransportEvent },
    ReconnectDue { timer: u64 },
}

/// Resources acquired by one successful connect attempt.
struct Opened {
    connection: Connection,
    capture: Option<CapturePipeline>,
    playback: Option<PlaybackPipeline>,
}

/// A dispatched tool batch waiting for its turn to reply.
struct PendingBatch {
    calls: Vec<(String, String)>,
    task: JoinHandle<Vec<ToolResult>>,
}

/// Everything bound to the current transport.
struct ActiveSession {
    generation: u64,
    closer: Closer,
    tool_batches: mpsc::UnboundedSender<PendingBatch>,
    reply_task: Option<JoinHandle<()>>,
    capture: Option<CapturePipeline>,
    playback: Option<Arc<PlaybackPipeline>>,
    video: Option<VideoStreamer>,
    meter_task: Option<JoinHandle<()>>,
    forward_task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    /// Stop pipelines and close the transport. Safe to call more than once.
    fn release(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(video) = self.video.take() {
            video.stop();
        }
        if let Some(task) = self.meter_task.take() {
            task.abort();
        }
        if let Some(playback) = self.playback.take() {
            playback.stop();
        }
        if let Some(task) = self.forward_task.take() {
            task.abort();
        }
        if let Some(task) = self.reply_task.take() {
            task.abort();
        }
        self.closer.close();
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle to the session actor.
pub struct SessionManager {
    tx: mpsc::Sender<Message>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionManager {
    /// Spawn the session actor. Must be called inside a tokio runtime.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<CapabilityRegistry>,
        devices: MediaDevices,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);
        let (status_tx, status) = watch::channel(SessionStatus::Disconnected);

        let actor = Actor {
            declarations: registry.declarations(),
            dispatcher: Dispatcher::new(registry, config.tool_timeouts.clone()),
            fsm: ConnectionFsm::new(config.reconnect.clone()),
            config,
            connector,
            devices,
            generation: Arc::new(AtomicU64::new(0)),
            session: None,
            link: SessionLink::detached(),
            resumption_handle: None,
            pending_connect: None,
            reconnect_timer: None,
            timer_seq: 0,
            events: events.clone(),
            status: status_tx,
            tx: tx.clone(),
        };
        let task = tokio::spawn(actor.run(rx));

        Self {
            tx,
            events,
            status,
            task,
        }
    }

    /// Open the session.
    ///
    /// Resolves once the first attempt settles: `Ok` when the session is open,
    /// or immediately when an attempt is already in flight or a session is
    /// already open. On a transient failure the error is returned and a
    /// backoff retry is already scheduled; authentication and media device
    /// failures are returned without any retry.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Connect(reply))
            .await
            .map_err(|_| LiveError::ChannelClosed)?;
        rx.await.map_err(|_| LiveError::ChannelClosed)?
    }

    /// End the session and suppress any reconnect. Returns after teardown.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Disconnect(reply)).await.is_err() {
            warn!("Session actor already stopped");
            return;
        }
        let _ = rx.await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Actor {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    declarations: Vec<FunctionDeclaration>,
    devices: MediaDevices,
    fsm: ConnectionFsm,
    generation: Arc<AtomicU64>,
    session: Option<ActiveSession>,
    link: SessionLink,
    resumption_handle: Option<String>,
    pending_connect: Option<oneshot::Sender<Result<()>>>,
    reconnect_timer: Option<(u64, JoinHandle<()>)>,
    timer_seq: u64,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
    tx: mpsc::Sender<Message>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        debug!("Session actor started");
        while let Some(message) = rx.recv().await {
            match message {
                Message::Connect(reply) => self.on_connect(reply),
                Message::Disconnect(reply) => {
                    self.on_disconnect();
                    let _ = reply.send(());
                }
                Message::Opened { generation, result } => self.on_opened(generation, result),
                Message::Transport { generation, event } => self.on_transport(generation, event),
                Message::ReconnectDue { timer } => self.on_reconnect_due(timer),
            }
        }
        debug!("Session actor stopped");
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: SessionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("Session status: {:?}", status);
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn on_connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.fsm.connect_requested() {
            Action::Connect => {
                self.cancel_reconnect_timer();
                if let Some(previous) = self.pending_connect.replace(reply) {
                    let _ = previous.send(Ok(()));
                }
                self.start_attempt();
            }
            _ => {
                debug!("Connect is a no-op in state {:?}", self.fsm.state());
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn on_disconnect(&mut self) {
        info!("Disconnect requested");
        self.fsm.disconnect();
        self.set_status(self.fsm.state().status());
        self.cancel_reconnect_timer();
        // Invalidate in-flight connects and tool batches.
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(LiveError::ConnectionClosed));
        }
        self.teardown();
        self.fsm.closed_by_host();
        self.set_status(SessionStatus::Disconnected);
    }

    fn start_attempt(&mut self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(SessionStatus::Connecting);
        info!("Opening session (generation {})", generation);

        let setup = BidiGenerateContentSetup::from_config(
            &self.config,
            self.declarations.clone(),
            self.resumption_handle.clone(),
        );
        let connector = self.connector.clone();
        let devices = self.devices.clone();
        let block_samples = self.config.capture_block_samples;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = open_session(connector, setup, devices, generation, block_samples).await;
            let _ = tx.send(Message::Opened { generation, result }).await;
        });
    }

    fn on_opened(&mut self, generation: u64, result: Result<Opened>) {
        if generation != self.current_generation() {
            if let Ok(opened) = result {
                info!("Discarding session from superseded attempt {}", generation);
                release_opened(opened);
            }
            return;
        }

        match result {
            Ok(opened) => {
                self.fsm.opened();
                self.bind(generation, opened);
                self.set_status(SessionStatus::Open);
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) if e.is_terminal() => {
                error!("Connect failed: {}", e);
                self.teardown();
                self.fsm.terminal_failure();
                self.set_status(SessionStatus::Disconnected);
                self.emit(SessionEvent::Failed(e.to_string()));
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Err(e));
                }
            }
            Err(e) => {
                warn!("Connect attempt failed: {}", e);
                let action = self.fsm.closed(Closure::Error);
                self.apply(action);
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    /// Attach a freshly opened transport and start everything that runs while open.
    fn bind(&mut self, generation: u64, opened: Opened) {
        let Opened {
            connection,
            capture,
            playback,
        } = opened;
        let Connection {
            handle,
            mut events,
            closer,
        } = connection;

        self.link = SessionLink::bound(generation, handle);

        let tx = self.tx.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = matches!(event, TransportEvent::Closed(_));
                if tx.send(Message::Transport { generation, event }).await.is_err() || closed {
                    return;
                }
            }
            let event = TransportEvent::Closed(CloseKind::Error("transport event stream ended".to_string()));
            let _ = tx.send(Message::Transport { generation, event }).await;
        });

        let video = self.devices.video.clone().map(|source| {
            VideoStreamer::start(source, self.link.clone(), FrameSettings::from(&self.config))
        });

        let playback = playback.map(Arc::new);
        let meter_task = playback.as_ref().map(|playback| {
            let meter = playback.meter().clone();
            let events = self.events.clone();
            let period = self.config.meter_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let _ = events.send(SessionEvent::Level {
                        rms: meter.level(),
                        bands: meter.bands(),
                    });
                }
            })
        });

        let (tool_batches, batch_rx) = mpsc::unbounded_channel();
        let reply_task = tokio::spawn(reply_loop(
            batch_rx,
            self.link.clone(),
            generation,
            self.generation.clone(),
            self.events.clone(),
        ));

        self.session = Some(ActiveSession {
            generation,
            closer,
            tool_batches,
            reply_task: Some(reply_task),
            capture,
            playback,
            video,
            meter_task,
            forward_task: Some(forward_task),
        });
        info!("Session {} open", generation);
    }

    fn on_transport(&mut self, generation: u64, event: TransportEvent) {
        let current = self.session.as_ref().map(|s| s.generation);
        if current != Some(generation) {
            debug!("Ignoring event from stale session {}: {:?}", generation, event);
            return;
        }

        match event {
            TransportEvent::Server(event) => self.on_server_event(event),
            TransportEvent::Closed(kind) => {
                info!("Session {} closed: {:?}", generation, kind);
                self.teardown();
                let closure = match kind {
                    CloseKind::Clean => Closure::Clean,
                    CloseKind::Error(_) => Closure::Error,
                };
                let action = self.fsm.closed(closure);
                self.apply(action);
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SetupComplete => debug!("Duplicate setupComplete ignored"),
            ServerEvent::Audio(pcm) => {
                let Some(playback) = self.session.as_ref().and_then(|s| s.playback.as_ref()) else {
                    return;
                };
                if let Err(e) = playback.enqueue(&pcm) {
                    warn!("Dropping undecodable audio chunk: {}", e);
                }
            }
            ServerEvent::Interrupted => {
                if let Some(playback) = self.session.as_ref().and_then(|s| s.playback.as_ref()) {
                    playback.interrupt();
                }
                self.emit(SessionEvent::Interrupted);
            }
            ServerEvent::Text(text) => self.emit(SessionEvent::Text(text)),
            ServerEvent::InputTranscription(t) => self.emit(SessionEvent::InputTranscript(t)),
            ServerEvent::OutputTranscription(t) => self.emit(SessionEvent::OutputTranscript(t)),
            ServerEvent::GenerationComplete => self.emit(SessionEvent::GenerationComplete),
            ServerEvent::TurnComplete => self.emit(SessionEvent::TurnComplete),
            ServerEvent::ToolCalls(calls) => self.spawn_tool_batch(calls),
            ServerEvent::ToolCallCancellation(ids) => {
                info!("Server cancelled tool call(s) {:?}", ids);
                self.emit(SessionEvent::ToolCallsCancelled(ids));
            }
            ServerEvent::GoAway { time_left } => {
                info!("Server going away (time left: {:?})", time_left);
            }
            ServerEvent::SessionResumption(handle) => {
                debug!("Stored session resumption handle");
                self.resumption_handle = Some(handle);
            }
        }
    }

    /// Run the batch's handlers now; the reply waits its turn behind earlier batches.
    fn spawn_tool_batch(&self, calls: Vec<ToolCall>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let ids = calls.iter().map(|c| (c.id.clone(), c.name.clone())).collect();
        let task = tokio::spawn(async move { dispatcher.dispatch(calls).await });

        if session.tool_batches.send(PendingBatch { calls: ids, task }).is_err() {
            warn!("Tool reply path for session {} is gone", session.generation);
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Ignore => {}
            Action::Connect => {
                self.cancel_reconnect_timer();
                self.start_attempt();
            }
            Action::ScheduleReconnect { attempt, delay } => {
                self.cancel_reconnect_timer();
                self.timer_seq += 1;
                let timer = self.timer_seq;
                let tx = self.tx.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Message::ReconnectDue { timer }).await;
                });
                self.reconnect_timer = Some((timer, handle));
                self.set_status(SessionStatus::Connecting);
                self.emit(SessionEvent::Reconnecting { attempt, delay });
            }
            Action::Fail { attempts } => {
                self.set_status(SessionStatus::Disconnected);
                self.emit(SessionEvent::Failed(format!(
                    "Connection failed after {} reconnect attempt(s)",
                    attempts
                )));
            }
            Action::Stop => self.set_status(SessionStatus::Disconnected),
        }
    }

    fn on_reconnect_due(&mut self, timer: u64) {
        match self.reconnect_timer.take() {
            Some((pending, _)) if pending == timer => {
                if self.fsm.reconnect_due() {
                    self.start_attempt();
                }
            }
            other => {
                debug!("Stale reconnect timer {} ignored", timer);
                self.reconnect_timer = other;
            }
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some((timer, handle)) = self.reconnect_timer.take() {
            debug!("Cancelling reconnect timer {}", timer);
            handle.abort();
        }
    }

    fn teardown(&mut self) {
        self.link.detach();
        match self.session.take() {
            Some(mut session) => {
                session.release();
                info!("Session {} torn down", session.generation);
            }
            None => debug!("Teardown: no active session"),
        }
    }
}

/// Send tool replies for one session generation, one batch at a time in arrival order.
async fn reply_loop(
    mut batches: mpsc::UnboundedReceiver<PendingBatch>,
    link: SessionLink,
    generation: u64,
    current: Arc<AtomicU64>,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(PendingBatch { calls, task }) = batches.recv().await {
        let results = match task.await {
            Ok(results) => Ok(results),
            Err(e) => Err(format!("dispatch task failed: {}", e)),
        };

        if current.load(Ordering::SeqCst) != generation {
            info!("Discarding {} tool result(s) from superseded session {}", calls.len(), generation);
            continue;
        }

        let failure = match results {
            Ok(results) => link
                .deliver(ClientMessage::tool_response(results))
                .await
                .err()
                .map(|e| e.to_string()),
            Err(reason) => Some(reason),
        };

        if let Some(reason) = failure {
            error!("Failed to send tool results: {}", reason);
            let fallback = Dispatcher::fallback_results(&calls, &reason);
            if let Err(e) = link.deliver(ClientMessage::tool_response(fallback.clone())).await {
                warn!("Could not deliver fallback tool results either: {}", e);
            }
            let _ = events.send(SessionEvent::ToolBatchFailed(fallback));
        }
    }
    debug!("Tool reply path for session {} closed", generation);
}

fn release_opened(opened: Opened) {
    let Opened {
        mut connection,
        capture,
        playback,
    } = opened;
    if let Some(capture) = capture {
        capture.stop();
    }
    if let Some(playback) = playback {
        playback.stop();
    }
    connection.closer.close();
}

/// Acquire devices and open the transport for one generation.
async fn open_session(
    connector: Arc<dyn Connector>,
    setup: BidiGenerateContentSetup,
    devices: MediaDevices,
    generation: u64,
    block_samples: usize,
) -> Result<Opened> {
    let playback = match devices.speaker {
        Some(speaker) => {
            let clock = devices.clock.clone();
            let started = tokio::task::spawn_blocking(move || PlaybackPipeline::start(speaker, clock))
                .await
                .map_err(|e| LiveError::MediaDevice(format!("audio output setup panicked: {}", e)))??;
            Some(started)
        }
        None => None,
    };

    let mut connection = connector.connect(setup).await?;

    let capture = match devices.microphone {
        Some(microphone) => {
            let link = SessionLink::bound(generation, connection.handle.clone());
            let started = tokio::task::spawn_blocking(move || CapturePipeline::start(microphone, link, block_samples))
                .await
                .map_err(|e| LiveError::MediaDevice(format!("microphone setup panicked: {}", e)))
                .and_then(|r| r);
            match started {
                Ok(capture) => Some(capture),
                Err(e) => {
                    connection.closer.close();
                    return Err(e);
                }
            }
        }
        None => None,
    };

    Ok(Opened {
        connection,
        capture,
        playback,
    })
}
