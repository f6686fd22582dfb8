//! Debugger commands and the pending-command queue.
//!
//! A [`Command`] is one line of gdb command-line syntax plus the metadata
//! the controller needs to route its eventual output: whether the command
//! resumes execution, whether it is a pure information request, and an
//! optional response tag that matches the tagged output block gdb will
//! produce for it.

use std::collections::VecDeque;

/// Reserved byte that introduces a tagged output block. gdb never emits it
/// as part of ordinary text, which is what makes the framing unambiguous.
pub const BLOCK_START: u8 = 0x1A;

/// One-byte routing tags for wrapped command output.
///
/// Tagged commands are bracketed with `set prompt \x1A<tag>` before and
/// `set prompt \x1Ai` after, so the block of output between the two prompt
/// echoes can be handed to the right consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseTag {
    /// No data attached; marks the prompt returning to its resting state.
    Idle,
    /// A `file:line:col:tag:address` annotation. gdb emits these on its own
    /// with a doubled marker, so the tag byte is the marker itself.
    SourcePosition,
    Frame,
    SetBreakpoint,
    Args,
    Locals,
    DataRequest,
    Whatis,
    BreakpointList,
    Backtrace,
    ThreadList,
    SwitchThread,
    Disassemble,
    MemoryDump,
    Registers,
    Libraries,
    Detach,
    UserCommand,
}

impl ResponseTag {
    pub fn as_byte(self) -> u8 {
        match self {
            ResponseTag::Idle => b'i',
            ResponseTag::SourcePosition => BLOCK_START,
            ResponseTag::Frame => b'f',
            ResponseTag::SetBreakpoint => b'b',
            ResponseTag::Args => b'a',
            ResponseTag::Locals => b'l',
            ResponseTag::DataRequest => b'd',
            ResponseTag::Whatis => b'w',
            ResponseTag::BreakpointList => b'B',
            ResponseTag::Backtrace => b't',
            ResponseTag::ThreadList => b'T',
            ResponseTag::SwitchThread => b'S',
            ResponseTag::Disassemble => b'D',
            ResponseTag::MemoryDump => b'm',
            ResponseTag::Registers => b'r',
            ResponseTag::Libraries => b'L',
            ResponseTag::Detach => b'x',
            ResponseTag::UserCommand => b'u',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        let tag = match byte {
            b'i' => ResponseTag::Idle,
            BLOCK_START => ResponseTag::SourcePosition,
            b'f' => ResponseTag::Frame,
            b'b' => ResponseTag::SetBreakpoint,
            b'a' => ResponseTag::Args,
            b'l' => ResponseTag::Locals,
            b'd' => ResponseTag::DataRequest,
            b'w' => ResponseTag::Whatis,
            b'B' => ResponseTag::BreakpointList,
            b't' => ResponseTag::Backtrace,
            b'T' => ResponseTag::ThreadList,
            b'S' => ResponseTag::SwitchThread,
            b'D' => ResponseTag::Disassemble,
            b'm' => ResponseTag::MemoryDump,
            b'r' => ResponseTag::Registers,
            b'L' => ResponseTag::Libraries,
            b'x' => ResponseTag::Detach,
            b'u' => ResponseTag::UserCommand,
            _ => return None,
        };
        Some(tag)
    }
}

/// A single queued debugger command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    is_run: bool,
    is_info: bool,
    tag: Option<ResponseTag>,
    key: Option<i32>,
}

impl Command {
    /// A command with no expected reply and no execution side effect,
    /// e.g. `set confirm off` or `delete 3`.
    pub fn plain(text: impl Into<String>) -> Self {
        Command {
            text: text.into(),
            is_run: false,
            is_info: false,
            tag: None,
            key: None,
        }
    }

    /// A command that resumes or starts execution.
    pub fn run(text: impl Into<String>) -> Self {
        Command {
            text: text.into(),
            is_run: true,
            is_info: false,
            tag: None,
            key: None,
        }
    }

    /// A pure information request. Safe to discard when superseded.
    pub fn info(text: impl Into<String>, tag: ResponseTag) -> Self {
        Command {
            text: text.into(),
            is_run: false,
            is_info: true,
            tag: Some(tag),
            key: None,
        }
    }

    /// A plain command that nevertheless expects tagged output,
    /// e.g. `info breakpoints` after a breakpoint edit.
    pub fn tagged(text: impl Into<String>, tag: ResponseTag) -> Self {
        Command {
            text: text.into(),
            is_run: false,
            is_info: false,
            tag: Some(tag),
            key: None,
        }
    }

    /// A breakpoint-set command carrying the collaborator's key so the
    /// confirmation can be routed back to the right breakpoint record.
    pub fn breakpoint_set(text: impl Into<String>, key: i32) -> Self {
        Command {
            text: text.into(),
            is_run: false,
            is_info: false,
            tag: Some(ResponseTag::SetBreakpoint),
            key: Some(key),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_run(&self) -> bool {
        self.is_run
    }

    pub fn is_info(&self) -> bool {
        self.is_info
    }

    pub fn tag(&self) -> Option<ResponseTag> {
        self.tag
    }

    pub fn key(&self) -> Option<i32> {
        self.key
    }

    /// True when the command stays in flight until a tagged block arrives.
    pub fn expects_reply(&self) -> bool {
        self.tag.is_some()
    }

    /// The bytes actually written to gdb's stdin. Tagged commands are
    /// wrapped in the prompt bracket that produces a tagged output block.
    pub fn wire_bytes(&self) -> Vec<u8> {
        match self.tag {
            Some(tag) if tag != ResponseTag::Idle && tag != ResponseTag::SourcePosition => {
                format!(
                    "set prompt {}{}\n{}\nset prompt {}i\n",
                    BLOCK_START as char,
                    tag.as_byte() as char,
                    self.text,
                    BLOCK_START as char,
                )
                .into_bytes()
            }
            _ => format!("{}\n", self.text).into_bytes(),
        }
    }
}

/// Ordered queue of commands waiting to be sent. FIFO, with head insertion
/// as the only reordering primitive.
#[derive(Debug, Default)]
pub struct CommandQueue {
    items: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue::default()
    }

    /// Insert a command. Queueing a run command supersedes every run
    /// command already waiting; when `purge_info` is set (silent or forced
    /// contexts) stale information requests are dropped along with them.
    pub fn enqueue(&mut self, cmd: Command, at_head: bool, purge_info: bool) {
        if cmd.is_run() {
            self.items
                .retain(|c| !(c.is_run() || (purge_info && c.is_info())));
        }

        if at_head {
            self.items.push_front(cmd);
        } else {
            self.items.push_back(cmd);
        }
    }

    /// Drop every queued run and information command. Used when forcing a
    /// pause whose refresh output would only describe stale state.
    pub fn purge_info_and_run(&mut self) {
        self.items.retain(|c| !(c.is_run() || c.is_info()));
    }

    /// Drop queued run commands so a paused program does not resume on its
    /// own; in silent mode the information requests go too.
    pub fn purge_for_pause(&mut self, silent: bool) {
        self.items
            .retain(|c| !(c.is_run() || (silent && c.is_info())));
    }

    pub fn purge_all(&mut self) {
        self.items.clear();
    }

    pub fn take_next(&mut self) -> Option<Command> {
        self.items.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Command texts in queue order, oldest first. Test and logging aid.
    pub fn texts(&self) -> Vec<&str> {
        self.items.iter().map(|c| c.text()).collect()
    }
}
