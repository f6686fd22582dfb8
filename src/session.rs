//! Async driver for one debugging session.
//!
//! Owns the controller and the transport event stream. Everything that
//! touches the controller happens on this one task, in arrival order;
//! collaborators talk to it through [`SessionHandle`] and listen on the
//! [`DebugEvent`] channel they supplied at spawn.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::config::SessionConfig;
use crate::controller::{BreakpointModify, Controller, Transport};
use crate::events::DebugEvent;
use crate::process::{self, TransportEvent};
use crate::Result;

/// How long a detach from an attached process may take before we give up
/// and quit anyway.
const DETACH_TIMEOUT: Duration = Duration::from_secs(3);
/// How long gdb gets to honor `quit` before it is killed.
const QUIT_TIMEOUT: Duration = Duration::from_secs(3);

/// A request from a collaborator, applied in order by the driver.
#[derive(Debug)]
pub enum SessionRequest {
    Run,
    RunUntil { file: Option<String>, line: u32 },
    StepInto,
    StepIntoInsn,
    StepOver,
    StepOverInsn,
    StepOut,
    Pause,
    SetBreakpoint { command: String, key: i32 },
    ClearBreakpoint(String),
    ModifyBreakpoint(BreakpointModify),
    ClearAllBreakpoints,
    SelectFrame { frame: u64, thread: i64, need_frames: bool },
    SetLocalsView(bool),
    LoadCore(PathBuf),
    Attach(u32),
    Disassemble { start: String, end: String },
    MemoryDump { address: String, amount: String },
    Registers,
    Libraries,
    UserCommand(String),
    RequestData(String),
    RequestType(String),
    Reconfigure(SessionConfig),
    /// Orderly shutdown: detach if attached, quit, kill on timeout.
    Stop,
}

enum Flow {
    Continue,
    Shutdown,
    Finished,
}

pub struct Session;

impl Session {
    /// Spawn gdb and the driver task. Events flow to `event_tx` from here
    /// on; the session runs until [`SessionRequest::Stop`], a user `quit`,
    /// or the death of the gdb process itself.
    pub fn spawn(
        config: SessionConfig,
        event_tx: mpsc::UnboundedSender<DebugEvent>,
    ) -> Result<SessionHandle> {
        let (transport, transport_rx) = process::spawn(&config)?;
        let controller = Controller::new(config, transport, event_tx);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(drive(controller, transport_rx, request_rx));
        Ok(SessionHandle { request_tx, join })
    }
}

/// Handle to a running session. Owns the driver task; dropping it
/// without calling [`SessionHandle::stop`] leaves gdb to be reaped when
/// the runtime shuts down.
pub struct SessionHandle {
    request_tx: mpsc::UnboundedSender<SessionRequest>,
    join: JoinHandle<()>,
}

impl SessionHandle {
    /// Returns false once the driver is gone.
    pub fn send(&self, request: SessionRequest) -> bool {
        self.request_tx.send(request).is_ok()
    }

    /// Request shutdown and wait for the driver to finish.
    pub async fn stop(self) {
        let _ = self.request_tx.send(SessionRequest::Stop);
        let _ = self.join.await;
    }
}

async fn drive<T: Transport>(
    mut controller: Controller<T>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut request_rx: mpsc::UnboundedReceiver<SessionRequest>,
) {
    controller.start();

    loop {
        let flow = tokio::select! {
            event = transport_rx.recv() => match event {
                Some(event) => handle_transport(&mut controller, event),
                None => Flow::Finished,
            },
            request = request_rx.recv() => match request {
                Some(request) => apply_request(&mut controller, request),
                // Every handle dropped; treat it as a stop.
                None => Flow::Shutdown,
            },
        };

        match flow {
            Flow::Continue => {}
            Flow::Shutdown => {
                shutdown(&mut controller, &mut transport_rx).await;
                return;
            }
            Flow::Finished => return,
        }
    }
}

fn handle_transport<T: Transport>(controller: &mut Controller<T>, event: TransportEvent) -> Flow {
    match event {
        TransportEvent::Stdout(bytes) => {
            if let Err(err) = controller.handle_stdout(&bytes) {
                controller.transport_failure(&err.to_string());
            }
            Flow::Continue
        }
        TransportEvent::Stderr(bytes) => {
            if let Err(err) = controller.handle_stderr(&bytes) {
                controller.transport_failure(&err.to_string());
            }
            Flow::Continue
        }
        TransportEvent::WroteStdin => {
            controller.on_write_complete();
            Flow::Continue
        }
        TransportEvent::WriteFailed(message) => {
            controller.transport_failure(&message);
            Flow::Continue
        }
        TransportEvent::Exited(code) => {
            log::debug!("gdb process exited with code {code:?}");
            controller.on_process_exited();
            Flow::Finished
        }
    }
}

fn apply_request<T: Transport>(controller: &mut Controller<T>, request: SessionRequest) -> Flow {
    match request {
        SessionRequest::Run => controller.run(),
        SessionRequest::RunUntil { file, line } => controller.run_until(file.as_deref(), line),
        SessionRequest::StepInto => controller.step_into(),
        SessionRequest::StepIntoInsn => controller.step_into_insn(),
        SessionRequest::StepOver => controller.step_over(),
        SessionRequest::StepOverInsn => controller.step_over_insn(),
        SessionRequest::StepOut => controller.step_out(),
        SessionRequest::Pause => controller.pause(),
        SessionRequest::SetBreakpoint { command, key } => {
            controller.set_breakpoint(&command, key)
        }
        SessionRequest::ClearBreakpoint(command) => controller.clear_breakpoint(&command),
        SessionRequest::ModifyBreakpoint(modify) => controller.modify_breakpoint(&modify),
        SessionRequest::ClearAllBreakpoints => controller.clear_all_breakpoints(),
        SessionRequest::SelectFrame {
            frame,
            thread,
            need_frames,
        } => controller.select_frame(frame, thread, need_frames),
        SessionRequest::SetLocalsView(on) => controller.set_locals_view(on),
        SessionRequest::LoadCore(path) => controller.load_core(&path),
        SessionRequest::Attach(pid) => controller.attach(pid),
        SessionRequest::Disassemble { start, end } => controller.disassemble(&start, &end),
        SessionRequest::MemoryDump { address, amount } => {
            controller.memory_dump(&address, &amount)
        }
        SessionRequest::Registers => controller.registers(),
        SessionRequest::Libraries => controller.libraries(),
        SessionRequest::UserCommand(text) => {
            if controller.user_command(&text) {
                return Flow::Shutdown;
            }
        }
        SessionRequest::RequestData(expression) => controller.request_data(&expression),
        SessionRequest::RequestType(expression) => controller.request_type(&expression),
        SessionRequest::Reconfigure(config) => controller.reconfigure(config),
        SessionRequest::Stop => return Flow::Shutdown,
    }
    Flow::Continue
}

/// Bounded, two-phase shutdown. Phase one stops a busy program and waits
/// out the detach; phase two sends `quit` and waits for the process to
/// die, killing it if it will not.
async fn shutdown<T: Transport>(
    controller: &mut Controller<T>,
    transport_rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
) {
    log::debug!("shutting down gdb session");
    controller.begin_shutdown();
    controller.set_waiting_on_timer(true);

    if controller.state().attached() {
        let deadline = Instant::now() + DETACH_TIMEOUT;
        while controller.state().attached() {
            match timeout_at(deadline, transport_rx.recv()).await {
                Ok(Some(event)) => {
                    if matches!(handle_transport(controller, event), Flow::Finished) {
                        controller.finish_shutdown();
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    log::warn!("detach timed out");
                    break;
                }
            }
        }
    }

    controller.send_quit();

    let deadline = Instant::now() + QUIT_TIMEOUT;
    let mut exited = false;
    while !exited {
        match timeout_at(deadline, transport_rx.recv()).await {
            Ok(Some(event)) => {
                exited = matches!(handle_transport(controller, event), Flow::Finished);
            }
            Ok(None) => break,
            Err(_) => {
                log::warn!("gdb ignored quit, killing it");
                controller.kill_transport();
                // One more bounded wait for the exit notification.
                let kill_deadline = Instant::now() + QUIT_TIMEOUT;
                while !exited {
                    match timeout_at(kill_deadline, transport_rx.recv()).await {
                        Ok(Some(event)) => {
                            exited =
                                matches!(handle_transport(controller, event), Flow::Finished);
                        }
                        _ => break,
                    }
                }
                break;
            }
        }
    }

    controller.finish_shutdown();
}
