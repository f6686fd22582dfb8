//! Process management for the gdb child.
//!
//! Spawns gdb, owns the pipe tasks and delivers everything the process
//! does as [`TransportEvent`]s on a single channel. Reads are chunked,
//! not line-buffered: the framing layer has to see output exactly as it
//! arrives, marker bytes and partial lines included.

use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::controller::Transport;
use crate::{GdbError, Result};

const READ_CHUNK: usize = 4096;

/// Something the gdb process did, delivered to the session driver.
#[derive(Debug)]
pub enum TransportEvent {
    /// Raw stdout bytes, cut wherever the pipe cut them.
    Stdout(Vec<u8>),
    /// Raw stderr bytes.
    Stderr(Vec<u8>),
    /// The previous stdin write has been flushed.
    WroteStdin,
    /// The stdin pipe is dead.
    WriteFailed(String),
    /// gdb itself is gone, with its exit code when one exists.
    Exited(Option<i32>),
}

/// Handle to a running gdb process. Writing, interrupting and killing go
/// through here; output and lifecycle come back on the event channel
/// returned by [`spawn`].
pub struct ProcessTransport {
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    kill_tx: mpsc::UnboundedSender<()>,
    pid: Option<u32>,
}

/// Start gdb per the configuration and wire up the pipe tasks.
pub fn spawn(
    config: &SessionConfig,
) -> Result<(ProcessTransport, mpsc::UnboundedReceiver<TransportEvent>)> {
    let mut command = Command::new(&config.gdb_path);
    if let Some(program) = &config.program {
        command.arg(program);
    }
    // -fullname makes gdb emit the marked source annotations the framer
    // keys on; -nx and -quiet keep user init files and banners out of
    // the protocol.
    command.args(["-fullname", "-nx", "-quiet"]);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    log::debug!("starting gdb: {}", config.gdb_path);
    let mut child = command.spawn()?;
    let pid = child.id();
    log::debug!("gdb started with PID: {pid:?}");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| GdbError::Transport("gdb stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| GdbError::Transport("gdb stdout unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| GdbError::Transport("gdb stderr unavailable".to_string()))?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();

    start_writer(stdin, writer_rx, event_tx.clone());
    start_reader(stdout, event_tx.clone(), TransportEvent::Stdout);
    start_reader(stderr, event_tx.clone(), TransportEvent::Stderr);
    start_waiter(child, kill_rx, event_tx);

    Ok((
        ProcessTransport {
            writer_tx,
            kill_tx,
            pid,
        },
        event_rx,
    ))
}

fn start_writer(
    mut stdin: tokio::process::ChildStdin,
    mut writer_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        log::debug!("gdb stdin writer started");
        while let Some(bytes) = writer_rx.recv().await {
            let outcome = async {
                stdin.write_all(&bytes).await?;
                stdin.flush().await
            }
            .await;
            match outcome {
                Ok(()) => {
                    let _ = event_tx.send(TransportEvent::WroteStdin);
                }
                Err(err) => {
                    log::error!("gdb stdin write error: {err}");
                    let _ = event_tx.send(TransportEvent::WriteFailed(err.to_string()));
                    break;
                }
            }
        }
        log::debug!("gdb stdin writer finished");
    });
}

fn start_reader<R>(
    mut pipe: R,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    wrap: fn(Vec<u8>) -> TransportEvent,
) where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        log::debug!("gdb pipe reader started");
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => {
                    log::debug!("gdb pipe: EOF reached");
                    break;
                }
                Ok(n) => {
                    if event_tx.send(wrap(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::error!("gdb pipe read error: {err}");
                    break;
                }
            }
        }
        log::debug!("gdb pipe reader finished");
    });
}

fn start_waiter(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    log::debug!("gdb exited: {status}");
                    status.code()
                }
                Err(err) => {
                    log::error!("wait on gdb failed: {err}");
                    None
                }
            },
            _ = kill_rx.recv() => {
                log::debug!("killing gdb");
                if let Err(err) = child.kill().await {
                    log::warn!("kill gdb failed: {err}");
                }
                None
            }
        };
        let _ = event_tx.send(TransportEvent::Exited(code));
    });
}

impl ProcessTransport {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Transport for ProcessTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer_tx
            .send(bytes.to_vec())
            .map_err(|_| GdbError::Transport("gdb stdin writer gone".to_string()))
    }

    fn interrupt(&mut self) {
        match self.pid {
            Some(pid) => {
                log::debug!("sending interrupt to gdb PID: {pid}");
                send_interrupt_signal(pid);
            }
            None => log::warn!("no PID to interrupt"),
        }
    }

    fn kill(&mut self) {
        let _ = self.kill_tx.send(());
    }
}

#[cfg(unix)]
fn send_interrupt_signal(pid: u32) {
    unsafe {
        if libc::kill(pid as i32, libc::SIGINT) != 0 {
            log::error!("failed to send SIGINT to PID {pid}");
        }
    }
}

#[cfg(windows)]
fn send_interrupt_signal(pid: u32) {
    unsafe {
        use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_C_EVENT};

        if GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid) == 0 {
            log::error!("GenerateConsoleCtrlEvent failed for PID {pid}");
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn send_interrupt_signal(pid: u32) {
    log::error!("interrupt not supported on this platform (PID {pid})");
}

/// Install handlers so the console ctrl event sent to gdb does not take
/// this process down with it.
#[cfg(windows)]
pub fn install_signal_protection() {
    unsafe {
        use winapi::shared::minwindef::{BOOL, DWORD, TRUE};
        use winapi::um::consoleapi::SetConsoleCtrlHandler;

        unsafe extern "system" fn ctrl_handler(ctrl_type: DWORD) -> BOOL {
            use winapi::um::wincon::{CTRL_BREAK_EVENT, CTRL_C_EVENT};

            match ctrl_type {
                CTRL_C_EVENT | CTRL_BREAK_EVENT => TRUE,
                _ => 0,
            }
        }

        if SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) == 0 {
            log::warn!("failed to install ctrl-c handler");
        }
    }
}

#[cfg(not(windows))]
pub fn install_signal_protection() {}
