//! Classification of untagged diagnostic lines.
//!
//! gdb's cli output is not a grammar; it is English prose with stable
//! prefixes. The classifier checks the specific, high-priority patterns
//! (fatal signals, program exit) before the generic ones, first match
//! wins, and every line falls through to *some* defined outcome. The
//! controller supplies the state-dependent interpretation.

use regex::Regex;

/// Where the program stopped, as parsed from a digit-leading line or a
/// source-position block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub address: Option<String>,
}

/// The classification of one reassembled, untagged line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// "Program exited ..." in any flavour.
    ProgramExited,
    /// "Program terminated ..." (seen when examining a core).
    ProgramTerminated,
    /// "Program received signal ...".
    Signal { sigint: bool, fatal: bool },
    /// "Cannot insert breakpoint N" with the breakpoint number when gdb
    /// printed one.
    CannotInsertBreakpoint(Option<u32>),
    /// "[New Thread ...]" chatter; the target is multi-threaded.
    NewThread,
    /// "Watchpoint N deleted because the program has left the block".
    WatchpointScopeExit(Option<u32>),
    /// Breakpoint/watchpoint chatter that only warrants a list refresh.
    BreakpointChatter,
    /// "Stopped due to shared library event".
    SharedLibraryStop,
    /// Core-file mismatch warnings that should be latched for later.
    CoreWarning,
    /// "Core was generated by ..." and friends.
    CoreStatus,
    /// Digit-leading program location line.
    Location(SourceLocation),
    /// Launch or ptrace failures; there is no application to debug.
    NoApplication,
    /// Recognised lines that stop the program and carry a message worth
    /// showing.
    PauseChatter,
    /// Recognised noise with no state effect at all.
    Noise,
    /// Everything else. While busy this is an implicit stop.
    Other,
}

/// Compiled patterns for the line classifier.
#[derive(Debug)]
pub struct Classifier {
    location: Regex,
    address: Regex,
    watchpoint_number: Regex,
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        // The patterns are fixed literals; compilation cannot fail.
        Classifier {
            location: Regex::new(r"^(.*):(\d+):\d+:[a-z]+:(0x[0-9a-fA-F]+)$")
                .unwrap_or_else(|e| unreachable!("location regex: {e}")),
            address: Regex::new(r"^(0x[0-9a-fA-F]+)")
                .unwrap_or_else(|e| unreachable!("address regex: {e}")),
            watchpoint_number: Regex::new(r"^Watchpoint (\d+)")
                .unwrap_or_else(|e| unreachable!("watchpoint regex: {e}")),
        }
    }

    /// Classify one line. Ordered, first match wins.
    pub fn classify(&self, line: &str) -> LineEvent {
        if line.starts_with("Prog") {
            return self.classify_program(line);
        }

        if line.starts_with("Cann") {
            if let Some(rest) = line.strip_prefix("Cannot insert breakpoint") {
                return LineEvent::CannotInsertBreakpoint(leading_number(rest));
            }
            return LineEvent::PauseChatter;
        }

        if line.starts_with("[New Thread") {
            return LineEvent::NewThread;
        }

        if line.starts_with("[Switching to Thread") || line.starts_with("Current language:") {
            return LineEvent::Noise;
        }

        if line.starts_with("Watc") {
            if line.starts_with("Watchpoint")
                && line.contains("deleted because the program has left the block")
            {
                let number = self
                    .watchpoint_number
                    .captures(line)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse().ok());
                return LineEvent::WatchpointScopeExit(number);
            }
            return LineEvent::BreakpointChatter;
        }

        if line.starts_with("Brea") || line.starts_with("Hard") {
            return LineEvent::BreakpointChatter;
        }

        if line.starts_with("Temp") {
            if line.starts_with("Temporarily disabling shared library breakpoints:") {
                return LineEvent::Noise;
            }
            return LineEvent::PauseChatter;
        }

        if line.starts_with("Stop") {
            if line.starts_with("Stopped due to shared library event") {
                return LineEvent::SharedLibraryStop;
            }
            return LineEvent::PauseChatter;
        }

        // Run-command startup chatter; falls out when execution starts,
        // not when it stops.
        if line.starts_with("No s") || line.starts_with("Sing") {
            return LineEvent::Noise;
        }

        if line.starts_with("warn") {
            if line.starts_with("warning: core file may not match")
                || line.starts_with("warning: exec file is newer")
            {
                return LineEvent::CoreWarning;
            }
            return LineEvent::Other;
        }

        if line.starts_with("Core") {
            return LineEvent::CoreStatus;
        }

        // Full location lines usually lead with an absolute path, not a
        // digit; the digit check alone only catches bare addresses.
        if self.location.is_match(line)
            || line.as_bytes().first().is_some_and(|b| b.is_ascii_digit())
        {
            return LineEvent::Location(self.parse_location(line));
        }

        if line.contains("not in executable format:")
            || line.contains("No such file or directory.")
            || line.contains("is not a core dump:")
            || line.starts_with("ptrace: No such process.")
            || line.starts_with("ptrace: Operation not permitted.")
        {
            return LineEvent::NoApplication;
        }

        if line.starts_with("No ") && line.contains("not meaningful") {
            return LineEvent::PauseChatter;
        }

        LineEvent::Other
    }

    fn classify_program(&self, line: &str) -> LineEvent {
        if line.starts_with("Program exited") {
            return LineEvent::ProgramExited;
        }
        if line.starts_with("Program terminated") {
            return LineEvent::ProgramTerminated;
        }
        if let Some(rest) = line.strip_prefix("Program received signal") {
            return LineEvent::Signal {
                sigint: rest.contains("SIGINT"),
                fatal: rest.contains("SIGSEGV") || rest.contains("SIGFPE"),
            };
        }
        // Any other "Program" line is a stop of some kind.
        LineEvent::PauseChatter
    }

    /// Parse a program-location line. A full
    /// `file:line:col:tag:address` match yields file, line and address;
    /// otherwise only a leading address can be salvaged.
    pub fn parse_location(&self, text: &str) -> SourceLocation {
        if let Some(caps) = self.location.captures(text) {
            let file = caps.get(1).map(|m| m.as_str().to_string());
            let line = caps.get(2).and_then(|m| m.as_str().parse().ok());
            let address = caps.get(3).map(|m| m.as_str().to_string());
            if line.is_some() {
                return SourceLocation {
                    file,
                    line,
                    address,
                };
            }
        }

        SourceLocation {
            file: None,
            line: None,
            address: self
                .address
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
        }
    }
}

fn leading_number(text: &str) -> Option<u32> {
    let trimmed = text.trim_start();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_lines() {
        let c = Classifier::new();
        assert_eq!(
            c.classify("Program exited normally."),
            LineEvent::ProgramExited
        );
        assert_eq!(
            c.classify("Program terminated with signal SIGKILL."),
            LineEvent::ProgramTerminated
        );
        assert_eq!(
            c.classify("Program received signal SIGINT, Interrupt."),
            LineEvent::Signal {
                sigint: true,
                fatal: false
            }
        );
        assert_eq!(
            c.classify("Program received signal SIGSEGV, Segmentation fault."),
            LineEvent::Signal {
                sigint: false,
                fatal: true
            }
        );
        assert_eq!(
            c.classify("Program stopped for no clear reason"),
            LineEvent::PauseChatter
        );
    }

    #[test]
    fn test_cannot_insert_breakpoint() {
        let c = Classifier::new();
        assert_eq!(
            c.classify("Cannot insert breakpoint 3"),
            LineEvent::CannotInsertBreakpoint(Some(3))
        );
        assert_eq!(
            c.classify("Cannot insert breakpoint"),
            LineEvent::CannotInsertBreakpoint(None)
        );
        assert_eq!(c.classify("Cannot access memory"), LineEvent::PauseChatter);
    }

    #[test]
    fn test_thread_and_breakpoint_chatter() {
        let c = Classifier::new();
        assert_eq!(c.classify("[New Thread 1024 (LWP 2301)]"), LineEvent::NewThread);
        assert_eq!(
            c.classify("[Switching to Thread 1024 (LWP 2301)]"),
            LineEvent::Noise
        );
        assert_eq!(
            c.classify("Breakpoint 2, main () at foo.c:10"),
            LineEvent::BreakpointChatter
        );
        assert_eq!(
            c.classify("Hardware watchpoint 4: x"),
            LineEvent::BreakpointChatter
        );
    }

    #[test]
    fn test_watchpoint_scope_exit() {
        let c = Classifier::new();
        assert_eq!(
            c.classify(
                "Watchpoint 5 deleted because the program has left the block in which its expression is valid."
            ),
            LineEvent::WatchpointScopeExit(Some(5))
        );
        assert_eq!(
            c.classify("Watchpoint 5: x"),
            LineEvent::BreakpointChatter
        );
    }

    #[test]
    fn test_shared_library_lines() {
        let c = Classifier::new();
        assert_eq!(
            c.classify("Stopped due to shared library event"),
            LineEvent::SharedLibraryStop
        );
        assert_eq!(
            c.classify("Temporarily disabling shared library breakpoints: 2"),
            LineEvent::Noise
        );
    }

    #[test]
    fn test_core_warnings() {
        let c = Classifier::new();
        assert_eq!(
            c.classify("warning: core file may not match specified executable file."),
            LineEvent::CoreWarning
        );
        assert_eq!(
            c.classify("Core was generated by `./crashme'."),
            LineEvent::CoreStatus
        );
        assert_eq!(c.classify("warning: something else"), LineEvent::Other);
    }

    #[test]
    fn test_location_full_match() {
        let c = Classifier::new();
        match c.classify("/src/foo.cpp:42:7:beg:0x1000") {
            LineEvent::Location(loc) => {
                assert_eq!(loc.file.as_deref(), Some("/src/foo.cpp"));
                assert_eq!(loc.line, Some(42));
                assert_eq!(loc.address.as_deref(), Some("0x1000"));
            }
            other => panic!("expected location, got {other:?}"),
        }
    }

    #[test]
    fn test_location_address_fallback() {
        let c = Classifier::new();
        match c.classify("0x401b22f2 in ?? ()") {
            LineEvent::Location(loc) => {
                assert_eq!(loc.file, None);
                assert_eq!(loc.line, None);
                assert_eq!(loc.address.as_deref(), Some("0x401b22f2"));
            }
            other => panic!("expected location, got {other:?}"),
        }
    }

    #[test]
    fn test_no_application_diagnostics() {
        let c = Classifier::new();
        assert_eq!(
            c.classify("/tmp/foo: not in executable format: File format not recognized"),
            LineEvent::NoApplication
        );
        assert_eq!(
            c.classify("ptrace: Operation not permitted."),
            LineEvent::NoApplication
        );
    }

    #[test]
    fn test_fallthrough() {
        let c = Classifier::new();
        assert_eq!(c.classify("Current language: auto; currently c++"), LineEvent::Noise);
        assert_eq!(c.classify("No symbol \"x\" in current context."), LineEvent::Noise);
        assert_eq!(
            c.classify("No registers: not meaningful in outermost frame."),
            LineEvent::PauseChatter
        );
        assert_eq!(c.classify("something unheard of"), LineEvent::Other);
    }
}
