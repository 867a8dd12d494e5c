// src/service.rs
//
// Serial service reactor.
// A single task owns the `SessionManager`. Requests arrive as commands with a
// oneshot reply; reader chunks arrive on a second channel. Both are handled in
// turn by the same task, so session state is never touched concurrently and a
// closed session can never see another chunk.
//
// Push notifications (fast frames, flash progress, disconnects) go out on a
// broadcast channel.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer_store::DEFAULT_TERMINAL_CAPACITY;
use crate::decode::FastFrameResult;
use crate::error::{Result, SessionError};
use crate::flasher::{FlashEvent, FlashOrchestrator, FlashOutcome, FlashRequest};
use crate::io::{PortEvent, PortInfo, SerialTransport};
use crate::recorder::{RecordStartStatus, RecordStopStatus, RecordingOptions};
use crate::sessions::{
    open_link, CloseStatus, FlushStatus, OpenOutcome, PortOptions, SessionInfo, SessionManager, WriteStatus,
};
use crate::settings::Settings;

/// Buffered push notifications per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 64;

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    /// A fast frame completed on `path`
    FastFrame {
        path: String,
        #[serde(rename = "data")]
        frame: FastFrameResult,
    },
    FlashProgress { message: String },
    FlashComplete { success: bool, outcome: FlashOutcome },
    /// The device went away or its reader failed; the session is gone
    PortClosed { path: String, reason: String },
}

// ============================================================================
// Firmware Picker
// ============================================================================

/// Lets the user choose a firmware image
#[async_trait]
pub trait FirmwarePicker: Send + Sync {
    async fn pick_firmware(&self) -> Option<PathBuf>;
}

/// Native file dialog filtered to `.bin` images
#[cfg(feature = "dialog")]
pub struct DialogPicker;

#[cfg(feature = "dialog")]
#[async_trait]
impl FirmwarePicker for DialogPicker {
    async fn pick_firmware(&self) -> Option<PathBuf> {
        tokio::task::spawn_blocking(|| {
            rfd::FileDialog::new()
                .set_title("Select firmware image")
                .add_filter("Firmware", &["bin"])
                .pick_file()
        })
        .await
        .ok()
        .flatten()
    }
}

// ============================================================================
// Commands
// ============================================================================

type Query = Box<dyn FnOnce(&mut SessionManager) + Send>;

enum Command {
    /// Synchronous access to the registry
    Query(Query),
    Close {
        path: String,
        reply: oneshot::Sender<CloseStatus>,
    },
    StartFlash {
        request: FlashRequest,
        reply: oneshot::Sender<Result<u64>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Service
// ============================================================================

pub struct SerialService;

impl SerialService {
    /// Spawn the reactor. Must be called within a tokio runtime.
    pub fn start(settings: &Settings, transport: Arc<dyn SerialTransport>) -> SerialServiceHandle {
        Self::start_with_picker(settings, transport, None)
    }

    pub fn start_with_picker(
        settings: &Settings,
        transport: Arc<dyn SerialTransport>,
        picker: Option<Arc<dyn FirmwarePicker>>,
    ) -> SerialServiceHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (port_tx, port_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (flash_tx, flash_rx) = mpsc::unbounded_channel();

        let manager = SessionManager::new(transport.clone(), port_tx, settings.buffer_limits());
        let flasher = FlashOrchestrator::new(transport.clone(), settings.flash_config());

        tokio::spawn(forward_flash_events(flash_rx, events.clone()));

        let reactor = Reactor {
            manager,
            flasher: flasher.clone(),
            flash_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(reactor.run(cmd_rx, port_rx));

        tlog!("[service] Serial service started");

        SerialServiceHandle {
            cmd_tx,
            events,
            transport,
            flasher,
            picker,
            default_options: settings.port_options(),
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }
}

struct Reactor {
    manager: SessionManager,
    flasher: FlashOrchestrator,
    flash_tx: mpsc::UnboundedSender<FlashEvent>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Reactor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut port_rx: mpsc::UnboundedReceiver<PortEvent>,
    ) {
        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(event) = port_rx.recv() => self.handle_port_event(event).await,
            }
        }

        self.flasher.cancel();
        self.manager.close_all().await;
        tlog!("[service] Serial service stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Query(query) => query(&mut self.manager),
            Command::Close { path, reply } => {
                let status = self.manager.close(&path).await;
                let _ = reply.send(status);
            }
            Command::StartFlash { request, reply } => {
                let _ = reply.send(self.start_flash(request).await);
            }
            Command::Shutdown { .. } => {}
        }
    }

    async fn start_flash(&mut self, request: FlashRequest) -> Result<u64> {
        if self.flasher.is_running() {
            return Err(SessionError::FlashBusy);
        }
        // The touch and the tool both need the port to themselves
        if self.manager.close(&request.port).await == CloseStatus::Closed {
            tlog!("[service] Closed {} before flashing", request.port);
        }
        let job = self.flasher.start(request, self.flash_tx.clone())?;
        Ok(job.id)
    }

    async fn handle_port_event(&mut self, event: PortEvent) {
        match event {
            PortEvent::Data {
                path,
                generation,
                bytes,
            } => {
                for frame in self.manager.ingest(&path, generation, &bytes) {
                    let _ = self.events.send(ServiceEvent::FastFrame {
                        path: path.clone(),
                        frame,
                    });
                }
            }
            PortEvent::Ended {
                path,
                generation,
                reason,
            } => {
                if self.manager.handle_reader_ended(&path, generation, &reason).await {
                    let _ = self.events.send(ServiceEvent::PortClosed {
                        path,
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }
}

async fn forward_flash_events(
    mut flash_rx: mpsc::UnboundedReceiver<FlashEvent>,
    events: broadcast::Sender<ServiceEvent>,
) {
    while let Some(event) = flash_rx.recv().await {
        let event = match event {
            FlashEvent::Progress(message) => ServiceEvent::FlashProgress { message },
            FlashEvent::Complete(outcome) => ServiceEvent::FlashComplete {
                success: outcome.success(),
                outcome,
            },
        };
        let _ = events.send(event);
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable front door to the reactor
#[derive(Clone)]
pub struct SerialServiceHandle {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ServiceEvent>,
    transport: Arc<dyn SerialTransport>,
    flasher: FlashOrchestrator,
    picker: Option<Arc<dyn FirmwarePicker>>,
    default_options: PortOptions,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl SerialServiceHandle {
    /// Receive push notifications from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Open parameters from settings
    pub fn default_options(&self) -> &PortOptions {
        &self.default_options
    }

    async fn query<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SessionManager) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let query: Query = Box::new(move |manager: &mut SessionManager| {
            let _ = reply.send(f(manager));
        });
        self.cmd_tx
            .send(Command::Query(query))
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        rx.await.map_err(|_| SessionError::ServiceStopped)
    }

    pub async fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.available_ports())
            .await
            .map_err(|e| SessionError::TaskFailed(e.to_string()))?
    }

    /// Open `path`. The device itself is opened on a blocking thread so a
    /// slow driver does not hold up the reactor.
    pub async fn open(&self, path: &str, options: PortOptions) -> Result<OpenOutcome> {
        let path = path.to_string();
        let check = path.clone();
        if self.query(move |m| m.is_open(&check)).await? {
            tlog!("[session] Port {} already open, ignoring open request", path);
            return Ok(OpenOutcome::AlreadyOpen);
        }

        let transport = self.transport.clone();
        let (target, baud_rate) = (path.clone(), options.baud_rate);
        let link = tokio::task::spawn_blocking(move || open_link(transport.as_ref(), &target, baud_rate))
            .await
            .map_err(|e| SessionError::TaskFailed(e.to_string()))??;
        self.query(move |m| m.attach(&path, &options, link)).await
    }

    pub async fn close(&self, path: &str) -> Result<CloseStatus> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close {
                path: path.to_string(),
                reply,
            })
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        rx.await.map_err(|_| SessionError::ServiceStopped)
    }

    pub async fn is_open(&self, path: &str) -> Result<bool> {
        let path = path.to_string();
        self.query(move |m| m.is_open(&path)).await
    }

    /// Write to `path`, or to any open port when `path` is `None`
    pub async fn write(&self, path: Option<&str>, data: &[u8]) -> Result<WriteStatus> {
        let path = path.map(str::to_string);
        let data = data.to_vec();
        let pending = self.query(move |m| m.write(path.as_deref(), &data)).await??;
        tokio::task::spawn_blocking(move || pending.wait())
            .await
            .map_err(|e| SessionError::TaskFailed(e.to_string()))?
    }

    pub async fn latest_row(&self, path: &str) -> Result<Vec<f64>> {
        let path = path.to_string();
        self.query(move |m| m.latest_row(&path)).await
    }

    pub async fn fast_frame(&self, path: &str) -> Result<FastFrameResult> {
        let path = path.to_string();
        self.query(move |m| m.fast_frame(&path)).await
    }

    /// Most recent terminal lines, at most `max` and never more than 200
    pub async fn terminal_lines(&self, path: &str, max: Option<usize>) -> Result<Vec<String>> {
        let path = path.to_string();
        let max = max.unwrap_or(DEFAULT_TERMINAL_CAPACITY).min(DEFAULT_TERMINAL_CAPACITY);
        self.query(move |m| m.terminal_lines(&path, max)).await
    }

    pub async fn headers(&self, path: &str) -> Result<Vec<String>> {
        let path = path.to_string();
        self.query(move |m| m.headers(&path)).await
    }

    pub async fn set_headers(&self, path: &str, headers: Vec<String>) -> Result<()> {
        let path = path.to_string();
        self.query(move |m| m.set_headers(&path, headers)).await?
    }

    pub async fn colors(&self, path: &str) -> Result<Vec<String>> {
        let path = path.to_string();
        self.query(move |m| m.colors(&path)).await
    }

    pub async fn set_colors(&self, path: &str, colors: Vec<String>) -> Result<()> {
        let path = path.to_string();
        self.query(move |m| m.set_colors(&path, colors)).await?
    }

    pub async fn flush_buffers(&self, path: &str) -> Result<FlushStatus> {
        let path = path.to_string();
        self.query(move |m| m.flush_buffers(&path)).await
    }

    pub async fn session_info(&self, path: &str) -> Result<Option<SessionInfo>> {
        let path = path.to_string();
        self.query(move |m| m.session_info(&path)).await
    }

    pub async fn start_recording(&self, path: &str, options: RecordingOptions) -> Result<RecordStartStatus> {
        let path = path.to_string();
        self.query(move |m| m.start_recording(&path, options)).await?
    }

    pub async fn stop_recording(&self, path: &str) -> Result<RecordStopStatus> {
        let path = path.to_string();
        self.query(move |m| m.stop_recording(&path)).await?
    }

    /// Ask the picker for a firmware file; `None` without a picker or on cancel
    pub async fn choose_firmware_file(&self) -> Option<PathBuf> {
        match &self.picker {
            Some(picker) => picker.pick_firmware().await,
            None => None,
        }
    }

    /// Start flashing. Closes an open session on the port first.
    /// Progress and completion arrive as `ServiceEvent`s.
    pub async fn start_flash(&self, request: FlashRequest) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::StartFlash { request, reply })
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        rx.await.map_err(|_| SessionError::ServiceStopped)?
    }

    /// Returns whether a job was running
    pub fn cancel_flash(&self) -> bool {
        self.flasher.cancel()
    }

    pub fn is_flashing(&self) -> bool {
        self.flasher.is_running()
    }

    /// Close every session, finalize recordings and stop the reactor
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        rx.await.map_err(|_| SessionError::ServiceStopped)?;

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}
