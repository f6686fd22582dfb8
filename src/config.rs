//! Session configuration.
//!
//! Read once at `start()` and again on an explicit reconfigure; the
//! controller diffs the display toggles and pushes the corresponding
//! `set` commands to a live session.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Everything the bootstrap layer decides before a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the gdb binary.
    pub gdb_path: String,
    /// The program to debug. `None` when attaching or examining a core.
    pub program: Option<PathBuf>,
    /// Arguments passed via `set args`.
    pub program_args: String,
    /// Working directory changed to with `cd` before the program runs.
    pub working_dir: Option<PathBuf>,
    /// Environment overrides applied with `set environment`.
    pub environment: Vec<(String, String)>,
    /// Slave side of the pty the application runs on.
    pub tty: Option<String>,
    /// Break on shared-library load so pending breakpoints can be placed.
    pub break_on_library_load: bool,
    /// Allow breakpoint edits to interrupt and transparently resume a
    /// running program.
    pub force_breakpoint_set: bool,
    pub display_static_members: bool,
    pub demangle_names: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            gdb_path: "gdb".to_string(),
            program: None,
            program_args: String::new(),
            working_dir: None,
            environment: Vec::new(),
            tty: None,
            break_on_library_load: true,
            force_breakpoint_set: true,
            display_static_members: false,
            demangle_names: true,
        }
    }
}
