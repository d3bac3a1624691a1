//! Interactive session console
//!
//! Lines read from stdin become session events; status updates are
//! printed as they arrive. The session itself is driven from the main
//! thread.

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};
use tunlink_session::{Command, SessionEvent, SessionOrchestrator, StatusUpdate};

/// Longest wait for the session to wind down on exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Parsed console line
#[derive(Debug)]
pub enum Input {
    Event(SessionEvent),
    Status,
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Option<Input> {
    let word = line.trim().to_ascii_lowercase();
    let input = match word.as_str() {
        "" => return None,
        "start" => Input::Event(SessionEvent::User(Command::Start)),
        "stop" => Input::Event(SessionEvent::User(Command::Stop)),
        "ping" => Input::Event(SessionEvent::User(Command::Ping)),
        "allow" | "yes" => Input::Event(SessionEvent::ConsentResolved { granted: true }),
        "deny" | "no" => Input::Event(SessionEvent::ConsentResolved { granted: false }),
        "status" => Input::Status,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(word),
    };
    Some(input)
}

pub fn render(update: &StatusUpdate) {
    match update {
        StatusUpdate::ConsentRequired(request) => {
            println!("{}", request.message);
            println!("Type 'allow' or 'deny'.");
        }
        other => println!("{}", other.describe()),
    }
}

fn print_help() {
    println!("Commands: start, stop, ping, allow, deny, status, quit");
}

/// Read stdin on its own thread, forwarding events to the session
fn spawn_reader(events: Sender<SessionEvent>, control: Sender<Input>) -> Result<()> {
    thread::Builder::new()
        .name("console-input".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let Some(input) = parse_input(&line) else { continue };

                let forwarded = match input {
                    Input::Event(event) => events.send(event).is_ok(),
                    other => control.send(other).is_ok(),
                };
                if !forwarded {
                    return;
                }
            }
            debug!("Console input closed");
            let _ = control.send(Input::Quit);
        })?;
    Ok(())
}

/// Drive `session` until quit, Ctrl-C or end of input, then stop it
pub fn run(
    session: &mut SessionOrchestrator,
    status: &Receiver<StatusUpdate>,
    control_tx: Sender<Input>,
    control_rx: &Receiver<Input>,
) -> Result<()> {
    spawn_reader(session.sender(), control_tx)?;
    print_help();

    loop {
        session.process_next(Duration::from_millis(100));
        for update in status.try_iter() {
            render(&update);
        }

        match control_rx.try_recv() {
            Ok(Input::Quit) => break,
            Ok(Input::Status) => println!("State: {}", session.state()),
            Ok(Input::Help) => print_help(),
            Ok(Input::Unknown(word)) => println!("Unknown command '{}'", word),
            Ok(Input::Event(event)) => session.handle(event),
            Err(_) => {}
        }
    }

    info!("Shutting down session");
    let stopped = session.shutdown(SHUTDOWN_TIMEOUT);
    for update in status.try_iter() {
        render(&update);
    }
    if !stopped {
        anyhow::bail!("Session did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }
    Ok(())
}
