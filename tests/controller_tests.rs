/// Integration tests for the session controller.
///
/// These drive full debugger conversations through a recording transport:
/// scripted gdb output goes in, the commands and events that come out are
/// checked against what a real frontend would need.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use gdbsession::*;

#[derive(Clone, Default)]
struct Recorder {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    interrupts: Arc<Mutex<usize>>,
    kills: Arc<Mutex<usize>>,
}

impl Recorder {
    fn texts(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    fn interrupts(&self) -> usize {
        *self.interrupts.lock().unwrap()
    }

    fn kills(&self) -> usize {
        *self.kills.lock().unwrap()
    }
}

struct MockTransport {
    recorder: Recorder,
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.recorder.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn interrupt(&mut self) {
        *self.recorder.interrupts.lock().unwrap() += 1;
    }

    fn kill(&mut self) {
        *self.recorder.kills.lock().unwrap() += 1;
    }
}

struct Harness {
    ctrl: Controller<MockTransport>,
    recorder: Recorder,
    events: mpsc::UnboundedReceiver<DebugEvent>,
}

impl Harness {
    fn new() -> Self {
        Harness::with_config(SessionConfig::default())
    }

    fn with_config(config: SessionConfig) -> Self {
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let ctrl = Controller::new(
            config,
            MockTransport {
                recorder: recorder.clone(),
            },
            tx,
        );
        Harness {
            ctrl,
            recorder,
            events: rx,
        }
    }

    /// Acknowledge writes until the controller has nothing more to send.
    fn drain(&mut self) {
        loop {
            let before = self.recorder.write_count();
            self.ctrl.on_write_complete();
            if self.recorder.write_count() == before {
                break;
            }
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.ctrl.handle_stdout(bytes).unwrap();
        self.drain();
    }

    /// Start gdb and get the init sequence out of the way.
    fn started() -> Self {
        let mut h = Harness::new();
        h.ctrl.start();
        h.drain();
        h
    }

    /// Start, run, and confirm a stop so the session sits paused at a
    /// known location with an empty queue.
    fn paused() -> Self {
        let mut h = Harness::started();
        h.ctrl.run();
        h.drain();
        h.feed(b"\x1a\x1a/src/main.c:10:0:beg:0x1000\n");
        h.feed(b"\x1at#0 main () at main.c:10\n\x1at");
        h
    }

    fn drain_events(&mut self) -> Vec<DebugEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

#[test]
fn test_full_session_conversation() {
    let mut h = Harness::started();

    let init = h.recorder.texts();
    assert_eq!(init[0], "set edit off\n");
    assert!(init.iter().any(|t| t == "set confirm off\n"));
    assert!(init.iter().any(|t| t == "handle SIG32 pass nostop noprint\n"));

    h.ctrl.run();
    h.drain();
    assert!(h.ctrl.state().app_busy());
    assert_eq!(h.recorder.texts().last().map(String::as_str), Some("run\n"));

    // Breakpoint hit: chatter line, then the source annotation.
    h.feed(b"Breakpoint 1, main () at main.c:10\n\x1a\x1a/src/main.c:10:0:beg:0x1000\n");
    assert!(!h.ctrl.state().app_busy());

    // The stop refreshes the breakpoint list and the backtrace.
    let sent = h.recorder.texts();
    assert!(sent.iter().any(|t| t.contains("backtrace")));
    h.feed(b"\x1at#0 main () at main.c:10\n\x1at");
    h.feed(b"\x1aB1 breakpoint keep y\n\x1aB");

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        DebugEvent::StepLocation { file: Some(f), line: Some(10), .. } if f == "/src/main.c"
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, DebugEvent::BacktraceAvailable(_))));

    // Inspect some state, then let it run to completion.
    h.ctrl.request_data("x + y");
    h.drain();
    assert!(h.recorder.texts().iter().any(|t| t.contains("print x + y")));
    h.feed(b"\x1ad$1 = 7\n\x1ad");
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, DebugEvent::VariableData { tag: ResponseTag::DataRequest, .. })));

    h.ctrl.run();
    h.drain();
    h.feed(b"Program exited normally.\n");
    assert!(h.ctrl.state().program_exited());
    assert!(h.ctrl.state().app_not_started());
    assert!(h.ctrl.queue().is_empty());
}

#[test]
fn test_fragmented_delivery_matches_whole_delivery() {
    let stream: &[u8] =
        b"\x1aiBreakpoint 1, main () at main.c:10\n\x1a\x1a/src/main.c:10:0:beg:0x1000\n";

    let mut whole = Harness::started();
    whole.ctrl.run();
    whole.drain();
    whole.feed(stream);
    let whole_sent = whole.recorder.texts();
    let whole_state = whole.ctrl.state();

    for split in 0..=stream.len() {
        let mut split_h = Harness::started();
        split_h.ctrl.run();
        split_h.drain();
        split_h.feed(&stream[..split]);
        split_h.feed(&stream[split..]);

        assert_eq!(split_h.recorder.texts(), whole_sent, "split at {split}");
        assert_eq!(split_h.ctrl.state(), whole_state, "split at {split}");
    }
}

#[test]
fn test_at_most_one_command_in_flight() {
    let mut h = Harness::started();
    h.ctrl.registers();
    h.ctrl.libraries();
    h.drain();

    // The registers request is awaiting its reply; the library list may
    // not go out yet.
    let sent = h.recorder.texts();
    assert!(sent.iter().any(|t| t.contains("info all-registers")));
    assert!(!sent.iter().any(|t| t.contains("info sharedlibrary")));

    h.feed(b"\x1arrax 0x0\n\x1ar");
    assert!(h
        .recorder
        .texts()
        .iter()
        .any(|t| t.contains("info sharedlibrary")));
}

#[test]
fn test_repeated_forced_breakpoint_edits_queue_one_continue() {
    let mut h = Harness::started();
    h.ctrl.run();
    h.drain();

    h.ctrl.set_breakpoint("break a.c:1", 1);
    h.ctrl.set_breakpoint("break a.c:2", 2);

    let continues = h
        .ctrl
        .queue()
        .texts()
        .iter()
        .filter(|t| **t == "continue")
        .count();
    assert_eq!(continues, 1);
    assert_eq!(h.ctrl.queue().texts().last().copied(), Some("continue"));
}

#[test]
fn test_forced_edit_requires_permission() {
    let config = SessionConfig {
        force_breakpoint_set: false,
        ..SessionConfig::default()
    };
    let mut h = Harness::with_config(config);
    h.ctrl.start();
    h.drain();
    h.ctrl.run();
    h.drain();

    h.ctrl.set_breakpoint("break a.c:1", 1);
    assert_eq!(h.recorder.interrupts(), 0);
    assert!(h.ctrl.queue().is_empty());
}

#[test]
fn test_pause_interrupts_and_drops_queued_runs() {
    let mut h = Harness::started();
    h.ctrl.run();
    h.drain();

    h.ctrl.pause();
    assert_eq!(h.recorder.interrupts(), 1);

    h.feed(b"Program received signal SIGINT, Interrupt.\n\x1a\x1a/src/main.c:12:0:beg:0x1200\n");
    assert!(!h.ctrl.state().app_busy());
    assert_eq!(h.ctrl.viewed_thread(), -1);
    assert_eq!(h.ctrl.current_frame(), 0);
}

#[test]
fn test_thread_switch_commits_only_on_reply() {
    let mut h = Harness::paused();

    // Select a frame on the stop thread first so a thread is viewed.
    h.ctrl.select_frame(1, -1, false);
    h.drain();
    h.feed(b"\x1af#1 outer () at main.c:20\n\x1a\x1a/src/main.c:20:0:beg:0x2000\n\x1af");
    assert_eq!(h.ctrl.current_frame(), 1);

    // Right after a stop no thread is explicitly viewed; selecting one
    // needs no switch command and commits nothing.
    let writes_before = h.recorder.write_count();
    h.ctrl.user_command("thread 2");
    h.drain();
    assert_eq!(h.ctrl.viewed_thread(), -1);
    assert_eq!(h.recorder.write_count(), writes_before);
}

#[test]
fn test_user_command_routing_to_tagged_request() {
    let mut h = Harness::paused();

    assert!(!h.ctrl.user_command("info registers"));
    h.drain();
    assert!(h
        .recorder
        .texts()
        .iter()
        .any(|t| t.contains("set prompt \x1au\ninfo registers")));

    h.feed(b"\x1aurax 0x0\n\x1au");
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, DebugEvent::DebuggerOutput(text) if text.contains("rax"))));

    assert!(h.ctrl.user_command("quit"));
}

#[test]
fn test_desynchronized_output_is_an_error() {
    let mut h = Harness::started();

    let mut junk = vec![b'\x1a', b't'];
    junk.extend(std::iter::repeat(b'x').take(Framer::DEFAULT_MAX_BUFFER + 1));
    let err = h.ctrl.handle_stdout(&junk).unwrap_err();
    assert!(matches!(err, GdbError::Desynchronized(_)));

    // The driver reports the failure; the session ends with the process
    // killed and nothing left queued.
    h.ctrl.transport_failure(&err.to_string());
    assert_eq!(h.recorder.kills(), 1);
    assert!(h.ctrl.queue().is_empty());
}

#[test]
fn test_attach_detach_lifecycle() {
    let mut h = Harness::started();
    h.ctrl.attach(1234);
    h.drain();
    assert!(h.ctrl.state().attached());
    assert!(h.recorder.texts().iter().any(|t| t == "attach 1234\n"));

    h.ctrl.begin_shutdown();
    h.drain();
    assert!(h.ctrl.state().shutting_down());
    assert!(h.recorder.texts().iter().any(|t| t.contains("detach")));

    h.feed(b"\x1axDetaching from program: /bin/app, process 1234\n\x1ax");
    assert!(!h.ctrl.state().attached());

    h.ctrl.finish_shutdown();
    let events = h.drain_events();
    match events.last() {
        Some(DebugEvent::StatusChanged { message, .. }) => {
            assert_eq!(message, "Debugger stopped");
        }
        other => panic!("expected a final status event, got {other:?}"),
    }
}

#[test]
fn test_core_file_mismatch_warning() {
    let mut h = Harness::started();
    h.ctrl.load_core(std::path::Path::new("/tmp/core.1234"));
    h.drain();
    assert!(h.recorder.texts().iter().any(|t| t == "core /tmp/core.1234\n"));

    h.feed(b"warning: core file may not match specified executable file.\n");
    h.feed(b"Core was generated by `./crashme'.\n");

    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, DebugEvent::Warning(text) if text.contains("may not match"))));
}

#[test]
fn test_reconfigure_pushes_only_changed_settings() {
    let mut h = Harness::started();
    let writes_before = h.recorder.write_count();

    let mut config = h.ctrl.config().clone();
    config.display_static_members = true;
    h.ctrl.reconfigure(config.clone());
    h.drain();

    let sent = h.recorder.texts()[writes_before..].to_vec();
    assert!(sent.iter().any(|t| t == "set print static-members on\n"));
    assert!(!sent.iter().any(|t| t.contains("asm-demangle")));

    // Same config again: nothing to push.
    let writes_before = h.recorder.write_count();
    h.ctrl.reconfigure(config);
    h.drain();
    assert_eq!(h.recorder.write_count(), writes_before);
}
