//! The session state machine.
//!
//! Owns the command queue, the in-flight command slot, the framer and the
//! line classifier, and decides what may be sent to gdb when. Be very
//! careful with the state flags here: the controller is totally dependent
//! on them reflecting reality. If the app is busy but the flags say
//! otherwise, we lose control of the session and the only way out is to
//! shut the controller down.
//!
//! Pending breakpoints and shared libraries deserve a note. gdb refuses a
//! breakpoint in a library that has not been dlopen'ed yet, so breakpoints
//! are kept pending and retried whenever gdb reports a shared-library
//! event (`set stop-on 1` makes it report them). On such an event during a
//! run or continue we retry the pending set, then silently continue; on a
//! step we stay stopped, because silently running on would be worse.

use std::path::Path;

use tokio::sync::mpsc;

use crate::classifier::{Classifier, LineEvent};
use crate::command::{Command, CommandQueue, ResponseTag, BLOCK_START};
use crate::config::SessionConfig;
use crate::events::DebugEvent;
use crate::framer::{Framer, OutputChunk};
use crate::state::SessionState;
use crate::Result;

/// The process-side operations the controller needs. The real transport
/// lives in [`crate::process`]; tests substitute a recording mock.
pub trait Transport {
    /// Queue bytes for gdb's stdin. Completion is reported back through
    /// [`Controller::on_write_complete`].
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    /// Deliver SIGINT (or the platform equivalent) to gdb.
    fn interrupt(&mut self);
    /// Forcibly terminate the process.
    fn kill(&mut self);
}

/// A requested change to an existing breakpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointModify {
    pub id: u32,
    pub condition: Option<String>,
    pub ignore_count: Option<u32>,
    pub enabled: Option<bool>,
}

#[derive(Debug)]
struct InFlight {
    cmd: Command,
    sent: bool,
}

/// Drives one gdb session. All methods are synchronous and must be called
/// from a single logical thread; the async driver in [`crate::session`]
/// marshals transport notifications onto that thread.
pub struct Controller<T: Transport> {
    config: SessionConfig,
    transport: T,
    events: mpsc::UnboundedSender<DebugEvent>,
    state: SessionState,
    queue: CommandQueue,
    in_flight: Option<InFlight>,
    framer: Framer,
    classifier: Classifier,
    /// -1 means none selected; the stop thread is the implicit target.
    viewed_thread: i64,
    current_frame: u64,
    pending_thread: Option<i64>,
    pending_frame: Option<u64>,
    program_has_exited: bool,
    bad_core: Option<String>,
}

impl<T: Transport> Controller<T> {
    pub fn new(
        config: SessionConfig,
        transport: T,
        events: mpsc::UnboundedSender<DebugEvent>,
    ) -> Self {
        Controller {
            config,
            transport,
            events,
            state: SessionState::initial(),
            queue: CommandQueue::new(),
            in_flight: None,
            framer: Framer::new(),
            classifier: Classifier::new(),
            viewed_thread: -1,
            current_frame: 0,
            pending_thread: None,
            pending_frame: None,
            program_has_exited: false,
            bad_core: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn viewed_thread(&self) -> i64 {
        self.viewed_thread
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Text of the command currently awaiting its response, if any.
    pub fn in_flight_text(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|fl| fl.cmd.text())
    }

    fn emit(&self, event: DebugEvent) {
        // A dropped receiver just means no collaborators remain.
        let _ = self.events.send(event);
    }

    fn emit_status(&self, message: &str) {
        self.emit(DebugEvent::StatusChanged {
            message: message.to_string(),
            state: self.state,
        });
    }

    fn queue_cmd(&mut self, cmd: Command) {
        self.queue.enqueue(cmd, false, self.state.silent());
        self.execute_next();
    }

    fn queue_cmd_at_head(&mut self, cmd: Command) {
        self.queue.enqueue(cmd, true, self.state.silent());
        self.execute_next();
    }

    /// Send the head of the queue if the session can accept a command.
    /// Nothing goes out while a write is unacknowledged or the app is
    /// busy; a sent command expecting a reply blocks the queue until its
    /// tagged block arrives.
    fn execute_next(&mut self) {
        if self.state.not_started() || self.state.waiting_on_write() || self.state.app_busy() {
            return;
        }

        if let Some(fl) = &self.in_flight {
            if fl.sent {
                if fl.cmd.expects_reply() {
                    return;
                }
                self.in_flight = None;
            }
        }

        if self.in_flight.is_none() {
            let Some(cmd) = self.queue.take_next() else {
                return;
            };
            self.in_flight = Some(InFlight { cmd, sent: false });
        }

        let (bytes, text, is_run) = match self.in_flight.as_mut() {
            Some(fl) => {
                fl.sent = true;
                (fl.cmd.wire_bytes(), fl.cmd.text().to_string(), fl.cmd.is_run())
            }
            None => return,
        };

        if let Err(err) = self.transport.write(&bytes) {
            log::error!("write to gdb failed: {err}");
            self.transport_failure(&format!("write to debugger failed: {err}"));
            return;
        }
        self.state.set_waiting_on_write(true);

        if is_run {
            self.state.set_app_not_started(false);
            self.state.set_program_exited(false);
            self.state.set_silent(false);
            self.state.set_app_busy(true);
        }

        log::debug!("sent: {text}");
        self.emit(DebugEvent::DebuggerOutput(format!("(gdb) {text}\n")));
        if !self.state.silent() {
            self.emit_status("");
        }
    }

    fn destroy_commands(&mut self) {
        self.in_flight = None;
        self.queue.purge_all();
    }

    // ----- lifecycle -------------------------------------------------

    /// Initialise a freshly spawned gdb. Seeds the configuration command
    /// sequence; the first command goes out immediately and the rest
    /// follow as each write is acknowledged.
    pub fn start(&mut self) {
        if !self.state.not_started() {
            return;
        }
        self.state.set_not_started(false);
        self.emit_status("");

        let config = self.config.clone();

        self.queue_cmd(Command::plain("set edit off"));
        self.queue_cmd(Command::plain("set confirm off"));
        self.queue_cmd(Command::plain(if config.display_static_members {
            "set print static-members on"
        } else {
            "set print static-members off"
        }));

        if let Some(tty) = &config.tty {
            self.queue_cmd(Command::plain(format!("tty {tty}")));
        }
        if !config.program_args.is_empty() {
            self.queue_cmd(Command::plain(format!("set args {}", config.program_args)));
        }

        // One variable per line, no pager stalls.
        self.queue_cmd(Command::plain("set width 0"));
        self.queue_cmd(Command::plain("set height 0"));

        // Any non-zero value satisfies gdb; this is what lets pending
        // breakpoints be retried on library load.
        self.queue_cmd(Command::plain(if config.break_on_library_load {
            "set stop-on 1"
        } else {
            "set stop-on 0"
        }));

        // Thread-library chatter signals we do not want stops for.
        self.queue_cmd(Command::plain("handle SIG32 pass nostop noprint"));
        self.queue_cmd(Command::plain("handle SIG43 pass nostop noprint"));

        self.queue_cmd(Command::plain(if config.demangle_names {
            "set print asm-demangle on"
        } else {
            "set print asm-demangle off"
        }));

        if let Some(dir) = &config.working_dir {
            self.queue_cmd(Command::plain(format!("cd {}", dir.display())));
        }
        for (name, value) in &config.environment {
            self.queue_cmd(Command::plain(format!("set environment {name}={value}")));
        }

        self.emit(DebugEvent::AcceptPendingBreakpoints);
    }

    /// Apply a new configuration. Display and library toggles are diffed
    /// and pushed to the live session, transparently pausing and resuming
    /// a busy program.
    pub fn reconfigure(&mut self, config: SessionConfig) {
        let old = std::mem::replace(&mut self.config, config);
        if self.state.not_started() {
            return;
        }

        let static_changed = old.display_static_members != self.config.display_static_members;
        let demangle_changed = old.demangle_names != self.config.demangle_names;
        let stop_on_changed = old.break_on_library_load != self.config.break_on_library_load;
        if !(static_changed || demangle_changed || stop_on_changed) {
            return;
        }

        let mut restart = false;
        if self.state.app_busy() {
            self.state.set_silent(true);
            self.pause();
            restart = true;
        }

        if static_changed {
            self.queue_cmd(Command::plain(if self.config.display_static_members {
                "set print static-members on"
            } else {
                "set print static-members off"
            }));
        }
        if demangle_changed {
            self.queue_cmd(Command::plain(if self.config.demangle_names {
                "set print asm-demangle on"
            } else {
                "set print asm-demangle off"
            }));
        }
        if stop_on_changed {
            self.queue_cmd(Command::plain(if self.config.break_on_library_load {
                "set stop-on 1"
            } else {
                "set stop-on 0"
            }));
        }

        if restart {
            self.queue_cmd(Command::run("continue"));
        }
    }

    /// Examine a core file instead of a live process.
    pub fn load_core(&mut self, core_file: &Path) {
        if self.state.not_started() || self.state.shutting_down() {
            return;
        }
        self.state.set_silent(false);
        self.state.set_core(true);
        self.queue_cmd(Command::plain(format!("core {}", core_file.display())));
        self.refresh_after_load();
    }

    /// Attach to a running process.
    pub fn attach(&mut self, pid: u32) {
        if self.state.not_started() || self.state.shutting_down() {
            return;
        }
        self.state.set_app_not_started(false);
        self.state.set_program_exited(false);
        self.state.set_silent(false);
        self.state.set_attached(true);
        self.queue_cmd(Command::plain(format!("attach {pid}")));
        self.refresh_after_load();
    }

    fn refresh_after_load(&mut self) {
        if self.state.view_threads() {
            self.queue_cmd_at_head(Command::info("info thread", ResponseTag::ThreadList));
        }
        self.queue_cmd(Command::info("backtrace", ResponseTag::Backtrace));
        if self.state.view_locals() {
            self.queue_cmd(Command::info("info args", ResponseTag::Args));
            self.queue_cmd(Command::info("info local", ResponseTag::Locals));
        }
    }

    // ----- execution control -----------------------------------------

    pub fn run(&mut self) {
        if self.state.app_busy() || self.state.not_started() || self.state.shutting_down() {
            return;
        }
        let text = if self.state.app_not_started() {
            "run"
        } else {
            "continue"
        };
        self.queue_cmd(Command::run(text));
    }

    pub fn run_until(&mut self, file: Option<&str>, line: u32) {
        if self.state.app_busy() || self.state.not_started() || self.state.shutting_down() {
            return;
        }
        let text = match file {
            Some(file) => format!("until {file}:{line}"),
            None => format!("until {line}"),
        };
        self.queue_cmd(Command::run(text));
    }

    fn step(&mut self, text: &str) {
        if self.state.app_busy() || self.state.app_not_started() || self.state.shutting_down() {
            return;
        }
        self.queue_cmd(Command::run(text));
    }

    pub fn step_into(&mut self) {
        self.step("step");
    }

    pub fn step_into_insn(&mut self) {
        self.step("stepi");
    }

    pub fn step_over(&mut self) {
        self.step("next");
    }

    pub fn step_over_insn(&mut self) {
        self.step("nexti");
    }

    pub fn step_out(&mut self) {
        self.step("finish");
    }

    /// Interrupt a busy program. Pending run commands are dropped so the
    /// app does not take off again, and in silent mode the stale
    /// information requests go with them. `app_busy` stays set until gdb
    /// confirms the stop.
    pub fn pause(&mut self) {
        self.queue.purge_for_pause(self.state.silent());
        if self.state.app_busy() {
            self.transport.interrupt();
        }
    }

    // ----- breakpoints -----------------------------------------------

    /// Common gate for breakpoint edits. Returns whether a continue must
    /// be queued after the edit, or `None` when the edit is not allowed
    /// right now.
    fn interrupt_for_edit(&mut self) -> Option<bool> {
        if self.state.not_started() || self.state.shutting_down() {
            return None;
        }
        if !self.state.app_busy() {
            return Some(false);
        }
        if !self.config.force_breakpoint_set {
            return None;
        }
        // Invisible pause bracket: interrupt, edit, continue.
        self.state.set_silent(true);
        self.queue.purge_info_and_run();
        self.transport.interrupt();
        Some(true)
    }

    /// Send a prepared breakpoint-set command. `key` identifies the
    /// breakpoint record for the confirmation event; -1 marks an internal
    /// breakpoint whose confirmation nobody wants.
    pub fn set_breakpoint(&mut self, command: &str, key: i32) {
        let Some(restart) = self.interrupt_for_edit() else {
            return;
        };
        self.queue_cmd(Command::breakpoint_set(command, key));
        if restart {
            self.queue_cmd(Command::run("continue"));
        }
    }

    pub fn clear_breakpoint(&mut self, command: &str) {
        let Some(restart) = self.interrupt_for_edit() else {
            return;
        };
        self.queue_cmd(Command::plain(command));
        // Not an info command: gdb does not announce the deletion, so
        // without the refresh the breakpoint list would go stale.
        self.queue_cmd(Command::tagged("info breakpoints", ResponseTag::BreakpointList));
        if restart {
            self.queue_cmd(Command::run("continue"));
        }
    }

    pub fn modify_breakpoint(&mut self, modify: &BreakpointModify) {
        let Some(restart) = self.interrupt_for_edit() else {
            return;
        };

        if let Some(condition) = &modify.condition {
            self.queue_cmd(Command::plain(format!(
                "condition {} {condition}",
                modify.id
            )));
        }
        if let Some(count) = modify.ignore_count {
            self.queue_cmd(Command::plain(format!("ignore {} {count}", modify.id)));
        }
        if let Some(enabled) = modify.enabled {
            let verb = if enabled { "enable" } else { "disable" };
            self.queue_cmd(Command::plain(format!("{verb} {}", modify.id)));
        }
        self.queue_cmd(Command::tagged("info breakpoints", ResponseTag::BreakpointList));

        if restart {
            self.queue_cmd(Command::run("continue"));
        }
    }

    pub fn clear_all_breakpoints(&mut self) {
        let Some(restart) = self.interrupt_for_edit() else {
            return;
        };
        self.queue_cmd(Command::plain("delete"));
        self.queue_cmd(Command::tagged("info breakpoints", ResponseTag::BreakpointList));
        if restart {
            self.queue_cmd(Command::run("continue"));
        }
    }

    // ----- inspection ------------------------------------------------

    fn info_gate(&self) -> bool {
        !(self.state.app_busy() || self.state.not_started() || self.state.shutting_down())
    }

    /// Switch the viewed frame and possibly thread. The context fields
    /// are committed only when gdb confirms the selection, never
    /// optimistically.
    pub fn select_frame(&mut self, frame: u64, thread: i64, need_frames: bool) {
        if !self.info_gate() {
            return;
        }

        if thread != -1 {
            // -1 right after a stop means we are already on the stop
            // thread; there is nothing to switch away from.
            if self.viewed_thread != -1 {
                if self.viewed_thread != thread {
                    self.queue_cmd(Command::info(
                        format!("thread {thread}"),
                        ResponseTag::SwitchThread,
                    ));
                }
                if need_frames {
                    self.queue_cmd(Command::info("backtrace", ResponseTag::Backtrace));
                }
                if need_frames || self.viewed_thread != thread || self.current_frame != frame {
                    self.queue_cmd(Command::info(
                        format!("frame {frame}"),
                        ResponseTag::Frame,
                    ));
                }
            }
        } else if self.current_frame != frame {
            self.queue_cmd(Command::info(format!("frame {frame}"), ResponseTag::Frame));
        }

        self.pending_thread = Some(thread);
        self.pending_frame = Some(frame);

        if self.state.view_locals() {
            self.queue_cmd(Command::info("info args", ResponseTag::Args));
            self.queue_cmd(Command::info("info local", ResponseTag::Locals));
        }
    }

    pub fn disassemble(&mut self, start: &str, end: &str) {
        if !self.info_gate() {
            return;
        }
        self.queue_cmd(Command::info(
            format!("disassemble {start} {end}"),
            ResponseTag::Disassemble,
        ));
    }

    pub fn memory_dump(&mut self, address: &str, amount: &str) {
        if !self.info_gate() {
            return;
        }
        self.queue_cmd(Command::info(
            format!("x/{amount}b {address}"),
            ResponseTag::MemoryDump,
        ));
    }

    pub fn registers(&mut self) {
        if !self.info_gate() {
            return;
        }
        self.queue_cmd(Command::info("info all-registers", ResponseTag::Registers));
    }

    pub fn libraries(&mut self) {
        if !self.info_gate() {
            return;
        }
        self.queue_cmd(Command::info("info sharedlibrary", ResponseTag::Libraries));
    }

    /// Fetch the value of an expression for a variable view.
    pub fn request_data(&mut self, expression: &str) {
        if !self.info_gate() {
            return;
        }
        self.queue_cmd(Command::info(
            format!("print {expression}"),
            ResponseTag::DataRequest,
        ));
    }

    /// Fetch the type of an expression for a variable view.
    pub fn request_type(&mut self, expression: &str) {
        if !self.info_gate() {
            return;
        }
        self.queue_cmd(Command::info(
            format!("whatis {expression}"),
            ResponseTag::Whatis,
        ));
    }

    /// Locals are only fetched while some locals branch is open; this
    /// speeds up stepping considerably.
    pub fn set_locals_view(&mut self, on: bool) {
        self.state.set_view_locals(on);
    }

    /// Route a raw command typed by the user. Returns true when the user
    /// asked to quit the session.
    pub fn user_command(&mut self, cmd: &str) -> bool {
        log::debug!("user command: {cmd}");

        if cmd.starts_with("step") || cmd.starts_with('c') {
            self.queue_cmd(Command::run(cmd));
            return false;
        }
        if cmd.starts_with("info lo") {
            self.queue_cmd(Command::info("info local", ResponseTag::Locals));
            return false;
        }
        if cmd.starts_with("info ar") {
            self.queue_cmd(Command::info("info args", ResponseTag::Args));
            return false;
        }
        if cmd.starts_with("info th") {
            self.queue_cmd_at_head(Command::info("info thread", ResponseTag::ThreadList));
            return false;
        }
        if cmd.starts_with("ba") || cmd.starts_with("bt") {
            self.queue_cmd_at_head(Command::info("backtrace", ResponseTag::Backtrace));
            return false;
        }

        let mut parts = cmd.split_whitespace();
        if let (Some(head), Some(arg)) = (parts.next(), parts.next()) {
            if head.starts_with("fr") && "frame".starts_with(head) {
                if let Ok(frame) = arg.parse::<u64>() {
                    self.select_frame(frame, self.viewed_thread, true);
                    return false;
                }
            }
            if head.starts_with("th") && "thread".starts_with(head) {
                if let Ok(thread) = arg.parse::<i64>() {
                    let frame = if thread != self.viewed_thread {
                        0
                    } else {
                        self.current_frame
                    };
                    self.select_frame(frame, thread, true);
                    return false;
                }
            }
        }

        if cmd.starts_with("qu") {
            return true;
        }

        self.queue_cmd(Command::info(cmd, ResponseTag::UserCommand));
        false
    }

    // ----- transport notifications -----------------------------------

    /// Raw bytes from gdb's stdout. May end anywhere, including inside a
    /// tagged block.
    pub fn handle_stdout(&mut self, bytes: &[u8]) -> Result<()> {
        let echo = scrub_markers(&String::from_utf8_lossy(bytes));
        if !echo.is_empty() {
            self.emit(DebugEvent::DebuggerOutput(echo));
        }

        let chunks = self.framer.feed(bytes)?;
        for chunk in chunks {
            match chunk {
                OutputChunk::Block { tag, body } => self.dispatch_block(tag, &body),
                OutputChunk::Line(line) => {
                    let event = self.classifier.classify(&line);
                    self.act_on_line(event, &line);
                }
            }
        }

        self.execute_next();
        Ok(())
    }

    /// stderr goes through the same parse path; gdb mixes diagnostics
    /// freely between the two streams.
    pub fn handle_stderr(&mut self, bytes: &[u8]) -> Result<()> {
        log::debug!("stderr: {}", String::from_utf8_lossy(bytes).trim_end());
        self.handle_stdout(bytes)
    }

    /// The previous stdin write has been accepted; the next command may go.
    pub fn on_write_complete(&mut self) {
        self.state.set_waiting_on_write(false);
        self.execute_next();
    }

    /// The gdb process itself is gone.
    pub fn on_process_exited(&mut self) {
        self.destroy_commands();
        self.state = self.state.reset_no_app();
        self.emit_status("Process exited");
        self.emit(DebugEvent::DebuggerOutput("(gdb) Process exited\n".to_string()));
    }

    /// The transport is unusable (spawn failure, dead pipe, framer
    /// desynchronization). Fatal to the session, never retried.
    pub fn transport_failure(&mut self, message: &str) {
        log::error!("transport failure: {message}");
        self.program_no_app(message, true);
        self.transport.kill();
    }

    // ----- shutdown --------------------------------------------------

    /// First phase of shutdown: go silent, drop everything pending, stop a
    /// busy program, and ask gdb to detach when we are attached. The
    /// session driver waits out the detach and quit with bounded timers.
    pub fn begin_shutdown(&mut self) {
        if self.state.shutting_down() {
            return;
        }
        self.state.set_shutting_down(true);
        self.state.set_silent(true);
        self.destroy_commands();
        self.pause();

        if self.state.attached() {
            self.queue_cmd(Command::tagged("detach", ResponseTag::Detach));
        }
    }

    /// Second phase: the quit directive, written directly so an unlucky
    /// queue state cannot hold it up.
    pub fn send_quit(&mut self) {
        if let Err(err) = self.transport.write(b"quit\n") {
            log::warn!("quit write failed: {err}");
        }
        self.emit(DebugEvent::DebuggerOutput("(gdb) quit\n".to_string()));
    }

    pub fn kill_transport(&mut self) {
        self.transport.kill();
    }

    /// Last phase: the process is gone or has been killed; leave the
    /// state machine in its terminal shape.
    pub fn finish_shutdown(&mut self) {
        self.state.set_waiting_on_timer(false);
        self.state = self.state.reset_no_app();
        self.destroy_commands();
        self.emit_status("Debugger stopped");
    }

    pub fn set_waiting_on_timer(&mut self, on: bool) {
        self.state.set_waiting_on_timer(on);
    }

    // ----- output interpretation -------------------------------------

    fn dispatch_block(&mut self, tag: ResponseTag, body: &str) {
        log::debug!("block {tag:?}: {} bytes", body.len());

        match tag {
            ResponseTag::Idle => {}
            ResponseTag::SourcePosition => self.parse_program_location(body),
            ResponseTag::Frame => self.parse_frame_selected(body),
            ResponseTag::SetBreakpoint => {
                if let Some(fl) = &self.in_flight {
                    // -1 keys mark internal breakpoints nobody tracks.
                    if let Some(key) = fl.cmd.key() {
                        if key != -1 {
                            self.emit(DebugEvent::BreakpointConfirmed {
                                raw: body.to_string(),
                                key,
                            });
                        }
                    }
                }
            }
            ResponseTag::Args
            | ResponseTag::Locals
            | ResponseTag::DataRequest
            | ResponseTag::Whatis => {
                self.emit(DebugEvent::VariableData {
                    tag,
                    raw: body.to_string(),
                });
            }
            ResponseTag::BreakpointList => {
                self.emit(DebugEvent::BreakpointListRefreshed(body.to_string()));
            }
            ResponseTag::Backtrace => {
                self.emit(DebugEvent::BacktraceAvailable(body.to_string()));
            }
            ResponseTag::ThreadList => {
                self.emit(DebugEvent::ThreadListAvailable(body.to_string()));
            }
            ResponseTag::SwitchThread => {
                if let Some(thread) = self.pending_thread.take() {
                    self.viewed_thread = thread;
                }
            }
            ResponseTag::Disassemble => {
                self.emit(DebugEvent::DisassemblyAvailable(body.to_string()));
            }
            ResponseTag::MemoryDump => {
                self.emit(DebugEvent::MemoryDumpAvailable(body.to_string()));
            }
            ResponseTag::Registers => {
                self.emit(DebugEvent::RegistersAvailable(body.to_string()));
            }
            ResponseTag::Libraries => {
                self.emit(DebugEvent::LibraryListAvailable(body.to_string()));
            }
            ResponseTag::Detach => self.state.set_attached(false),
            ResponseTag::UserCommand => {
                self.emit(DebugEvent::DebuggerOutput(body.to_string()));
            }
        }

        // The block satisfies the in-flight command when the tags match;
        // this is the only way a command naturally completes.
        if self
            .in_flight
            .as_ref()
            .is_some_and(|fl| fl.sent && fl.cmd.tag() == Some(tag))
        {
            self.in_flight = None;
        }
    }

    fn act_on_line(&mut self, event: LineEvent, raw: &str) {
        match event {
            LineEvent::ProgramExited => {
                log::debug!("program exited: {raw}");
                self.program_no_app(raw, false);
                self.program_has_exited = true;
            }
            LineEvent::ProgramTerminated => {
                if self.state.core() {
                    self.destroy_commands();
                    self.act_on_pause(raw);
                } else {
                    self.program_no_app(raw, false);
                }
                self.program_has_exited = true;
            }
            LineEvent::Signal { sigint, fatal } => {
                // Our own interrupt while silent; the user never asked to
                // see it.
                if sigint && self.state.silent() {
                    return;
                }
                if fatal {
                    // The app died a horrible death. Drop the pending
                    // commands and give the user the wreckage to inspect;
                    // note we are not quite dead yet.
                    self.destroy_commands();
                    self.act_on_pause(raw);
                    self.program_has_exited = true;
                    return;
                }
                self.act_on_pause(raw);
            }
            LineEvent::CannotInsertBreakpoint(number) => {
                // After an exit and restart, a breakpoint in a shared
                // library points at memory gdb no longer maps. Delete it
                // server-side, keep it pending for the next library load,
                // and carry on.
                if !self.program_has_exited {
                    log::debug!("ignoring: {raw}");
                    return;
                }
                self.state.set_silent(true);
                self.act_on_pause("");
                if let Some(number) = number {
                    self.emit(DebugEvent::UnableToSetBreakpoint(number));
                    self.queue_cmd(Command::plain(format!("delete {number}")));
                    self.queue_cmd(Command::tagged(
                        "info breakpoints",
                        ResponseTag::BreakpointList,
                    ));
                    self.queue_cmd(Command::run("continue"));
                }
            }
            LineEvent::NewThread => self.state.set_view_threads(true),
            LineEvent::WatchpointScopeExit(number) => {
                if let Some(number) = number {
                    self.queue_cmd(Command::plain(format!("delete {number}")));
                }
                self.act_on_pause(raw);
                self.queue_cmd(Command::tagged(
                    "info breakpoints",
                    ResponseTag::BreakpointList,
                ));
            }
            LineEvent::BreakpointChatter => {
                // Only the list needs refreshing; the state is unchanged.
                self.queue_cmd(Command::tagged(
                    "info breakpoints",
                    ResponseTag::BreakpointList,
                ));
            }
            LineEvent::SharedLibraryStop => {
                let resuming = self
                    .in_flight
                    .as_ref()
                    .is_some_and(|fl| fl.cmd.text() == "run" || fl.cmd.text() == "continue");
                if resuming {
                    // Set any pending breakpoints, then quietly carry on.
                    self.state.set_silent(true);
                    self.state.set_app_busy(false);
                    self.emit(DebugEvent::AcceptPendingBreakpoints);
                    self.queue_cmd(Command::run("continue"));
                } else {
                    // On a step the user keeps the stop; silently running
                    // on would be much worse.
                    self.act_on_pause(raw);
                }
            }
            LineEvent::CoreWarning => {
                self.bad_core = Some(raw.to_string());
                self.act_on_pause("");
            }
            LineEvent::CoreStatus => {
                self.act_on_pause(raw);
                if let Some(bad) = &self.bad_core {
                    if raw.starts_with("Core was generated by") {
                        self.emit(DebugEvent::Warning(format!(
                            "{bad}\n{raw}\nAny symbols gdb resolves are suspect"
                        )));
                    }
                }
            }
            LineEvent::Location(_) => self.parse_program_location(raw),
            LineEvent::NoApplication => self.program_no_app(raw, true),
            LineEvent::PauseChatter => self.act_on_pause(raw),
            LineEvent::Noise => {}
            LineEvent::Other => {
                // Anything unrecognised while busy is a stop of some kind.
                if self.state.app_busy() {
                    self.act_on_pause("");
                }
            }
        }
    }

    /// The program stopped. Clear busy, reset the frame context and queue
    /// the standard refresh; in silent mode the stop stays invisible.
    fn act_on_pause(&mut self, message: &str) {
        if !self.state.app_busy() {
            return;
        }
        log::debug!("acting on program pause");
        self.state.set_app_busy(false);

        // We are always at frame zero of the stop thread when the program
        // stops.
        self.viewed_thread = -1;
        self.current_frame = 0;

        if self.state.silent() {
            return;
        }
        self.emit_status(message);

        // These must be actioned before anything already queued; the
        // thread list has to land before the backtrace is interpreted.
        // Silent stops returned above, so the refresh never purges.
        self.queue
            .enqueue(Command::info("backtrace", ResponseTag::Backtrace), true, false);
        if self.state.view_threads() {
            self.queue.enqueue(
                Command::info("info thread", ResponseTag::ThreadList),
                true,
                false,
            );
        }
        if self.state.view_locals() {
            self.queue
                .enqueue(Command::info("info args", ResponseTag::Args), false, false);
            self.queue
                .enqueue(Command::info("info local", ResponseTag::Locals), false, false);
        }
        self.execute_next();

        self.emit(DebugEvent::AcceptPendingBreakpoints);
    }

    /// There is no application any more: it exited, the launch failed, or
    /// gdb itself died. gdb may still be running; only a run command makes
    /// sense from here.
    fn program_no_app(&mut self, message: &str, alert_user: bool) {
        self.state = self.state.reset_no_app();
        self.destroy_commands();
        self.viewed_thread = -1;
        self.current_frame = 0;
        self.emit_status(message);
        self.emit(DebugEvent::NoApplication {
            message: message.to_string(),
            alert_user,
        });
    }

    /// A program-location annotation, either a tagged block or a
    /// digit-leading line.
    fn parse_program_location(&mut self, text: &str) {
        if self.state.silent() {
            // A silent stop: a continue is queued somewhere. Unblock the
            // queue and say nothing.
            log::debug!("silent stop at: {text}");
            self.state.set_app_busy(false);
            return;
        }

        let location = self.classifier.parse_location(text);
        if location.file.is_some() && location.line.is_some() {
            self.act_on_pause("");
            self.emit(DebugEvent::StepLocation {
                file: location.file,
                line: location.line,
                address: location.address,
            });
            return;
        }

        if self.state.app_busy() {
            self.act_on_pause(&format!("No source: {text}"));
        } else {
            self.emit_status(&format!("No source: {text}"));
        }

        // The address is the only piece of this line we can still use.
        self.emit(DebugEvent::StepLocation {
            file: None,
            line: None,
            address: location.address,
        });
    }

    /// A frame-selection reply. The new position is buried in the output
    /// as a doubled-marker source annotation.
    fn parse_frame_selected(&mut self, body: &str) {
        if let Some(frame) = self.pending_frame.take() {
            self.current_frame = frame;
        }

        let marker = [BLOCK_START as char, BLOCK_START as char]
            .iter()
            .collect::<String>();
        if let Some(start) = body.find(&marker) {
            let after = &body[start + marker.len()..];
            let line = after.lines().next().unwrap_or(after).to_string();
            self.parse_program_location(&line);
            return;
        }

        if !self.state.silent() {
            self.emit(DebugEvent::StepLocation {
                file: None,
                line: None,
                address: None,
            });
            self.emit_status(&format!("No source: {body}"));
        }
    }
}

fn scrub_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == BLOCK_START as char {
            chars.next();
        } else {
            out.push(c);
        }
    }
    out
}
