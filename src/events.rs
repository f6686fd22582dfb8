//! Events delivered to collaborators.
//!
//! The breakpoint manager, frame stack and variable views receive these
//! over an unbounded channel. Payloads that the views parse themselves
//! (backtraces, breakpoint tables, locals) are passed through as the raw
//! text gdb produced.

use crate::command::ResponseTag;
use crate::state::SessionState;

/// A notification from the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// The session state changed; `message` may be empty.
    StatusChanged {
        message: String,
        state: SessionState,
    },
    /// The program stopped at a known location.
    StepLocation {
        file: Option<String>,
        line: Option<u32>,
        address: Option<String>,
    },
    /// Fresh `info breakpoints` output; the breakpoint manager re-syncs.
    BreakpointListRefreshed(String),
    /// gdb acknowledged a breakpoint-set command issued with `key`.
    BreakpointConfirmed { raw: String, key: i32 },
    /// gdb could not place this breakpoint; leave it pending.
    UnableToSetBreakpoint(u32),
    /// Raw backtrace output.
    BacktraceAvailable(String),
    /// Raw `info thread` output.
    ThreadListAvailable(String),
    /// Output of a variable-data request, routed by its tag
    /// (args, locals, print or whatis).
    VariableData { tag: ResponseTag, raw: String },
    DisassemblyAvailable(String),
    MemoryDumpAvailable(String),
    RegistersAvailable(String),
    LibraryListAvailable(String),
    /// A good moment to retry pending breakpoints (startup, stop,
    /// shared-library load).
    AcceptPendingBreakpoints,
    /// Echo of the traffic between controller and gdb, for a console view.
    DebuggerOutput(String),
    /// The debuggee is gone: exit, failed launch or transport death.
    NoApplication { message: String, alert_user: bool },
    /// Non-fatal condition the user should see (e.g. mismatched core).
    Warning(String),
}
