//! Session controller for command-line gdb.
//!
//! Drives a gdb child process over its plain cli interface: commands go
//! down a queue with at most one in flight, raw output is reframed into
//! tagged blocks and diagnostic lines, and a state machine arbitrates
//! what may be sent when. Collaborators (breakpoint manager, frame and
//! variable views) receive [`events::DebugEvent`]s over a channel and
//! never touch the process directly.

use thiserror::Error;

pub mod classifier;
pub mod command;
pub mod config;
pub mod controller;
pub mod events;
pub mod framer;
pub mod process;
pub mod session;
pub mod state;

pub use classifier::{Classifier, LineEvent, SourceLocation};
pub use command::{Command, CommandQueue, ResponseTag, BLOCK_START};
pub use config::SessionConfig;
pub use controller::{BreakpointModify, Controller, Transport};
pub use events::DebugEvent;
pub use framer::{Framer, OutputChunk};
pub use session::{Session, SessionHandle, SessionRequest};
pub use state::SessionState;

#[derive(Error, Debug)]
pub enum GdbError {
    #[error("failed to start gdb process: {0}")]
    ProcessStart(#[from] std::io::Error),
    #[error("transport closed: {0}")]
    Transport(String),
    #[error("debugger output desynchronized: {0}")]
    Desynchronized(String),
}

pub type Result<T> = std::result::Result<T, GdbError>;
