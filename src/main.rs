//! Minimal interactive console around a gdb session. Mostly a smoke-test
//! harness: type debugger commands, watch the events come back.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use gdbsession::{DebugEvent, Session, SessionConfig, SessionRequest};

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("gdbsession", log::LevelFilter::Debug)
        .init()
        .unwrap();

    gdbsession::process::install_signal_protection();

    let mut config = SessionConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--gdb" => {
                if let Some(path) = args.next() {
                    config.gdb_path = path;
                }
            }
            _ => config.program = Some(PathBuf::from(arg)),
        }
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let session = match Session::spawn(config, event_tx) {
        Ok(session) => session,
        Err(err) => {
            log::error!("failed to start session: {err}");
            std::process::exit(1);
        }
    };

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                DebugEvent::DebuggerOutput(text) => print!("{text}"),
                DebugEvent::StatusChanged { message, state } => {
                    if !message.is_empty() {
                        println!("* [{state}] {message}");
                    }
                }
                DebugEvent::StepLocation {
                    file,
                    line,
                    address,
                } => {
                    println!(
                        "* stopped at {}:{} ({})",
                        file.as_deref().unwrap_or("?"),
                        line.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string()),
                        address.as_deref().unwrap_or("?"),
                    );
                }
                DebugEvent::NoApplication { message, .. } => {
                    println!("* no application: {message}");
                }
                DebugEvent::Warning(text) => println!("* warning: {text}"),
                other => log::debug!("event: {other:?}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request = match line {
            "run" | "r" => SessionRequest::Run,
            "step" | "s" => SessionRequest::StepInto,
            "next" | "n" => SessionRequest::StepOver,
            "finish" => SessionRequest::StepOut,
            "pause" => SessionRequest::Pause,
            "quit" | "q" => break,
            _ => SessionRequest::UserCommand(line.to_string()),
        };
        if !session.send(request) {
            break;
        }
    }

    session.stop().await;
    log::info!("session closed");
}
