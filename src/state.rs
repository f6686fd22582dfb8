//! Session state flags.
//!
//! The controller's behaviour is driven entirely by this record. The flags
//! are orthogonal rather than exclusive: a session can be attached, silent
//! and busy at the same time. Every mutation funnels through the setters
//! here so the one hard invariant can be checked in a single place.

use std::fmt;

/// The orthogonal state flags of a debug session.
///
/// Invariant: `app_busy` and `app_not_started` are never set together. A
/// program that has not started cannot be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    not_started: bool,
    app_not_started: bool,
    app_busy: bool,
    program_exited: bool,
    attached: bool,
    silent: bool,
    core: bool,
    shutting_down: bool,
    waiting_on_write: bool,
    waiting_on_timer: bool,
    view_locals: bool,
    view_threads: bool,
}

impl SessionState {
    /// State at controller construction: nothing started, silent until the
    /// first real command is dispatched.
    pub fn initial() -> Self {
        SessionState {
            not_started: true,
            app_not_started: true,
            silent: true,
            ..SessionState::default()
        }
    }

    /// State after the debuggee is gone (exit, kill, bad launch). The view
    /// preferences and a shutdown in progress survive the reset.
    pub fn reset_no_app(self) -> Self {
        SessionState {
            app_not_started: true,
            program_exited: true,
            view_locals: self.view_locals,
            view_threads: self.view_threads,
            shutting_down: self.shutting_down,
            ..SessionState::default()
        }
    }

    fn validate(&self) {
        debug_assert!(
            !(self.app_busy && self.app_not_started),
            "app_busy and app_not_started are mutually exclusive"
        );
    }

    pub fn not_started(&self) -> bool {
        self.not_started
    }

    pub fn app_not_started(&self) -> bool {
        self.app_not_started
    }

    pub fn app_busy(&self) -> bool {
        self.app_busy
    }

    pub fn program_exited(&self) -> bool {
        self.program_exited
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    pub fn core(&self) -> bool {
        self.core
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn waiting_on_write(&self) -> bool {
        self.waiting_on_write
    }

    pub fn waiting_on_timer(&self) -> bool {
        self.waiting_on_timer
    }

    pub fn view_locals(&self) -> bool {
        self.view_locals
    }

    pub fn view_threads(&self) -> bool {
        self.view_threads
    }

    pub fn set_not_started(&mut self, on: bool) {
        self.not_started = on;
        self.validate();
    }

    pub fn set_app_not_started(&mut self, on: bool) {
        self.app_not_started = on;
        self.validate();
    }

    pub fn set_app_busy(&mut self, on: bool) {
        self.app_busy = on;
        self.validate();
    }

    pub fn set_program_exited(&mut self, on: bool) {
        self.program_exited = on;
        self.validate();
    }

    pub fn set_attached(&mut self, on: bool) {
        self.attached = on;
        self.validate();
    }

    pub fn set_silent(&mut self, on: bool) {
        self.silent = on;
        self.validate();
    }

    pub fn set_core(&mut self, on: bool) {
        self.core = on;
        self.validate();
    }

    pub fn set_shutting_down(&mut self, on: bool) {
        self.shutting_down = on;
        self.validate();
    }

    pub fn set_waiting_on_write(&mut self, on: bool) {
        self.waiting_on_write = on;
        self.validate();
    }

    pub fn set_waiting_on_timer(&mut self, on: bool) {
        self.waiting_on_timer = on;
        self.validate();
    }

    pub fn set_view_locals(&mut self, on: bool) {
        self.view_locals = on;
        self.validate();
    }

    pub fn set_view_threads(&mut self, on: bool) {
        self.view_threads = on;
        self.validate();
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.not_started {
            flags.push("not-started");
        }
        if self.app_not_started {
            flags.push("app-not-started");
        }
        if self.app_busy {
            flags.push("busy");
        }
        if self.program_exited {
            flags.push("exited");
        }
        if self.attached {
            flags.push("attached");
        }
        if self.silent {
            flags.push("silent");
        }
        if self.core {
            flags.push("core");
        }
        if self.shutting_down {
            flags.push("shutting-down");
        }
        if self.waiting_on_write {
            flags.push("waiting-on-write");
        }
        if self.waiting_on_timer {
            flags.push("waiting-on-timer");
        }
        if flags.is_empty() {
            write!(f, "idle")
        } else {
            write!(f, "{}", flags.join("|"))
        }
    }
}
