// src/flasher.rs
//
// Firmware flashing through an external management tool (mcumgr).
//
// Sequence, each step gated on the previous one:
//   1. touch the port at a low baud rate to drop the device into its bootloader
//   2. `conn add serial ...`       register the serial connection
//   3. `-c serial image upload`    upload the image
//   4. `-c serial reset`           reset the device
//
// Tool output is forwarded line by line as progress text. Only one job runs at
// a time; cancelling suppresses further steps and interrupts the running tool.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};
use crate::io::SerialTransport;

pub const MSG_TOUCHED: &str = "Serial port touched at 1200 baud. Waiting for bootloader…";
pub const MSG_ADD_CONNECTION_FAILED: &str = "Error: Failed to add connection.";
pub const MSG_UPLOAD_FAILED: &str = "Error: Firmware upload failed.";
pub const MSG_RESET_FAILED: &str = "Error: Reset failed.";
pub const MSG_SUCCESS: &str = "Success: Flashing and reset complete!";
pub const MSG_CANCELLED: &str = "Flash cancelled.";

/// Connection name registered with the tool
const CONNECTION_NAME: &str = "serial";

// ============================================================================
// Types
// ============================================================================

/// Tool location and timing used for every job
#[derive(Clone, Debug, PartialEq)]
pub struct FlashConfig {
    pub tool_path: String,
    pub touch_baud: u32,
    pub baud_rate: u32,
    pub mtu: u32,
    /// Wait after the touch for the bootloader to enumerate
    pub settle: Duration,
    /// How long an interrupted tool gets to exit before it is killed
    pub kill_grace: Duration,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            tool_path: "mcumgr".to_string(),
            touch_baud: 1200,
            baud_rate: 115_200,
            mtu: 128,
            settle: Duration::from_millis(500),
            kill_grace: Duration::from_millis(2000),
        }
    }
}

/// A flash request from the caller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlashRequest {
    pub port: String,
    pub firmware: PathBuf,
    /// Overrides the configured tool path
    #[serde(default)]
    pub tool: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashStep {
    Touch,
    AddConnection,
    Upload,
    Reset,
}

impl FlashStep {
    fn failure_message(self) -> &'static str {
        match self {
            FlashStep::Touch => "Error: Could not open port at 1200 baud.",
            FlashStep::AddConnection => MSG_ADD_CONNECTION_FAILED,
            FlashStep::Upload => MSG_UPLOAD_FAILED,
            FlashStep::Reset => MSG_RESET_FAILED,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashOutcome {
    Succeeded,
    Failed(FlashStep),
    Cancelled,
}

impl FlashOutcome {
    pub fn success(&self) -> bool {
        matches!(self, FlashOutcome::Succeeded)
    }
}

/// Notifications from a running job
#[derive(Clone, Debug, PartialEq)]
pub enum FlashEvent {
    Progress(String),
    Complete(FlashOutcome),
}

pub type FlashEventSender = mpsc::UnboundedSender<FlashEvent>;

/// Tool arguments for each tool-driven step
pub fn tool_args(step: FlashStep, config: &FlashConfig, port: &str, firmware: &str) -> Vec<String> {
    match step {
        FlashStep::Touch => Vec::new(),
        FlashStep::AddConnection => vec![
            "conn".into(),
            "add".into(),
            CONNECTION_NAME.into(),
            "type=serial".into(),
            format!(
                "connstring=dev={},baud={},mtu={}",
                port, config.baud_rate, config.mtu
            ),
        ],
        FlashStep::Upload => vec![
            "-c".into(),
            CONNECTION_NAME.into(),
            "image".into(),
            "upload".into(),
            firmware.to_string(),
        ],
        FlashStep::Reset => vec!["-c".into(), CONNECTION_NAME.into(), "reset".into()],
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct ActiveJob {
    id: u64,
    port: String,
    aborted: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
}

/// Owner of the single flash job slot
#[derive(Clone)]
pub struct FlashOrchestrator {
    transport: Arc<dyn SerialTransport>,
    config: FlashConfig,
    slot: Arc<Mutex<Option<ActiveJob>>>,
    next_id: Arc<AtomicU64>,
}

/// Handle to a started job
pub struct FlashJob {
    pub id: u64,
    handle: JoinHandle<FlashOutcome>,
}

impl FlashJob {
    /// Wait for the job to finish
    pub async fn wait(self) -> FlashOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tlog!("[flash] Job task failed: {:?}", e);
                FlashOutcome::Cancelled
            }
        }
    }
}

impl FlashOrchestrator {
    pub fn new(transport: Arc<dyn SerialTransport>, config: FlashConfig) -> Self {
        Self {
            transport,
            config,
            slot: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Port of the running job, if any
    pub fn active_port(&self) -> Option<String> {
        self.slot
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|job| job.port.clone()))
    }

    /// Start a job. Fails with `FlashBusy` while another job holds the slot.
    pub fn start(&self, request: FlashRequest, events: FlashEventSender) -> Result<FlashJob> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| SessionError::LockPoisoned("flash slot"))?;
        if slot.is_some() {
            return Err(SessionError::FlashBusy);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let aborted = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *slot = Some(ActiveJob {
            id,
            port: request.port.clone(),
            aborted: aborted.clone(),
            cancel_tx,
        });
        drop(slot);

        let mut config = self.config.clone();
        if let Some(tool) = request.tool.as_ref().filter(|t| !t.trim().is_empty()) {
            config.tool_path = tool.clone();
        }

        tlog!(
            "[flash] Job {} started: {} -> {} using {}",
            id,
            request.firmware.display(),
            request.port,
            config.tool_path
        );

        let run = FlashRun {
            transport: self.transport.clone(),
            config,
            request,
            aborted,
            cancel_rx,
            events: events.clone(),
        };
        let slot = self.slot.clone();
        let handle = tokio::spawn(async move {
            let outcome = run.execute().await;
            if let Ok(mut slot) = slot.lock() {
                if slot.as_ref().map(|job| job.id) == Some(id) {
                    *slot = None;
                }
            }
            tlog!("[flash] Job {} finished: {:?}", id, outcome);
            let _ = events.send(FlashEvent::Complete(outcome));
            outcome
        });

        Ok(FlashJob { id, handle })
    }

    /// Abort the running job. Returns false when nothing was running.
    pub fn cancel(&self) -> bool {
        let Ok(slot) = self.slot.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(job) => {
                tlog!("[flash] Cancel requested for job {}", job.id);
                job.aborted.store(true, Ordering::SeqCst);
                let _ = job.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Job Execution
// ============================================================================

struct FlashRun {
    transport: Arc<dyn SerialTransport>,
    config: FlashConfig,
    request: FlashRequest,
    aborted: Arc<AtomicBool>,
    cancel_rx: watch::Receiver<bool>,
    events: FlashEventSender,
}

enum ToolExit {
    Success,
    Failed(Option<i32>),
    SpawnError(SessionError),
    Cancelled,
}

impl FlashRun {
    fn progress(&self, message: impl Into<String>) {
        let _ = self.events.send(FlashEvent::Progress(message.into()));
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn execute(mut self) -> FlashOutcome {
        let outcome = self.run_steps().await;
        if outcome == FlashOutcome::Cancelled {
            self.progress(MSG_CANCELLED);
        }
        outcome
    }

    async fn run_steps(&mut self) -> FlashOutcome {
        if self.is_aborted() {
            return FlashOutcome::Cancelled;
        }

        if let Err(reason) = self.touch().await {
            self.progress(format!("{} {}", FlashStep::Touch.failure_message(), reason));
            return FlashOutcome::Failed(FlashStep::Touch);
        }
        self.progress(MSG_TOUCHED);

        let settle = self.config.settle;
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(settle) => false,
            _ = wait_cancelled(&mut self.cancel_rx) => true,
        };
        if cancelled {
            return FlashOutcome::Cancelled;
        }

        let firmware = self.request.firmware.to_string_lossy().to_string();
        for step in [FlashStep::AddConnection, FlashStep::Upload, FlashStep::Reset] {
            if self.is_aborted() {
                return FlashOutcome::Cancelled;
            }
            let args = tool_args(step, &self.config, &self.request.port, &firmware);
            match self.run_tool(&args).await {
                ToolExit::Success => {}
                ToolExit::Cancelled => return FlashOutcome::Cancelled,
                ToolExit::Failed(code) => {
                    tlog!("[flash] Step {:?} exited with {:?}", step, code);
                    self.progress(step.failure_message());
                    return FlashOutcome::Failed(step);
                }
                ToolExit::SpawnError(e) => {
                    tlog!("[flash] Step {:?}: {}", step, e);
                    let reason = match e {
                        SessionError::Spawn { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    self.progress(format!("Process error: {}", reason));
                    self.progress(step.failure_message());
                    return FlashOutcome::Failed(step);
                }
            }
        }

        self.progress(MSG_SUCCESS);
        FlashOutcome::Succeeded
    }

    /// Open and immediately close the port at the touch baud rate
    async fn touch(&self) -> std::result::Result<(), String> {
        let transport = self.transport.clone();
        let port = self.request.port.clone();
        let baud = self.config.touch_baud;
        let result = tokio::task::spawn_blocking(move || transport.open(&port, baud).map(drop))
            .await
            .map_err(|e| e.to_string())?;
        result.map_err(|e| match e {
            SessionError::PortUnavailable { reason, .. } => reason,
            other => other.to_string(),
        })
    }

    async fn run_tool(&mut self, args: &[String]) -> ToolExit {
        tlog!("[flash] Running {} {}", self.config.tool_path, args.join(" "));

        let mut child = match Command::new(&self.config.tool_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolExit::SpawnError(self.spawn_error(e)),
        };

        let mut forwarders: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|s| forward_lines(s, self.events.clone())),
            child.stderr.take().map(|s| forward_lines(s, self.events.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = wait_cancelled(&mut self.cancel_rx) => None,
        };

        let exit = match waited {
            Some(Ok(status)) => exit_of(status),
            Some(Err(e)) => ToolExit::SpawnError(self.spawn_error(e)),
            None => {
                terminate(&mut child, self.config.kill_grace).await;
                ToolExit::Cancelled
            }
        };

        // Emit all tool output before the step's verdict. A grandchild that
        // inherited the pipes can hold them open; give up after the grace.
        let drained = tokio::time::timeout(self.config.kill_grace, async {
            for forwarder in forwarders.iter_mut() {
                let _ = forwarder.await;
            }
        })
        .await;
        if drained.is_err() {
            tlog!("[flash] Tool output still open after exit, detaching");
            for forwarder in &forwarders {
                forwarder.abort();
            }
        }
        exit
    }

    fn spawn_error(&self, e: std::io::Error) -> SessionError {
        SessionError::Spawn {
            tool: self.config.tool_path.clone(),
            reason: e.to_string(),
        }
    }
}

fn exit_of(status: ExitStatus) -> ToolExit {
    if status.success() {
        ToolExit::Success
    } else {
        ToolExit::Failed(status.code())
    }
}

/// Forward each output line of a tool stream as progress text
fn forward_lines<R>(stream: R, events: FlashEventSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                let _ = events.send(FlashEvent::Progress(line));
            }
        }
    })
}

/// Resolves once cancellation has been signalled
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Interrupt the tool, then kill it if it lingers
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {
                    tlog!("[flash] Tool interrupted");
                    return;
                }
                Err(_) => tlog!("[flash] Tool ignored interrupt, killing"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tlog!("[flash] Failed to kill tool: {}", e);
    }
}
