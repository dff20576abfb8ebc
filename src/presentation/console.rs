// Terminal console - reads operator input and prints device traffic
use crate::application::device_session::{ConnectionState, DeviceSession};
use crate::domain::command::{CommandTable, PulseWidth, ValidationError};
use crate::domain::event::Event;
use crate::domain::parameters::ParameterSnapshot;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Received,
    Result,
    Error,
    System,
    Sent,
}

impl LineKind {
    fn marker(&self) -> &'static str {
        match self {
            LineKind::Received => " ",
            LineKind::Result => "*",
            LineKind::Error => "!",
            LineKind::System => "#",
            LineKind::Sent => ">",
        }
    }
}

/// What the operator asked for on one input line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Quit,
    Parameters,
    ListCommands,
    PulseWidth(PulseWidth),
    Token(String),
}

pub fn parse_input(line: &str, table: &CommandTable) -> Result<Option<ConsoleInput>, ValidationError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if keyword.eq_ignore_ascii_case("pw") {
        // Bare `pw` would otherwise reach the device as `p` with an empty value.
        return PulseWidth::parse(rest).map(|value| Some(ConsoleInput::PulseWidth(value)));
    }

    let input = match line {
        "quit" | "exit" => ConsoleInput::Quit,
        "params" => ConsoleInput::Parameters,
        "commands" => ConsoleInput::ListCommands,
        // Anything that is not a named command goes to the device as typed.
        _ => match table.lookup(line) {
            Ok(spec) => ConsoleInput::Token(spec.token.to_string()),
            Err(_) => ConsoleInput::Token(line.to_string()),
        },
    };
    Ok(Some(input))
}

pub fn describe_event(event: &Event) -> (LineKind, String) {
    match event {
        Event::Status(status) => (LineKind::System, status.summary()),
        Event::Result(result) => (LineKind::Result, result.summary()),
        Event::ErrorText(text) => (LineKind::Error, text.clone()),
        Event::LogText(text) | Event::PlainText(text) => (LineKind::Received, text.clone()),
        Event::ParseFailure { raw, reason } => {
            (LineKind::Error, format!("Unreadable message {:?}: {}", raw, reason))
        }
    }
}

pub fn format_parameters(snapshot: &ParameterSnapshot) -> String {
    format!(
        "Pulse width: {} | Peak time: {} | Hold duty: {} | Hold freq: {} | Pots: {}",
        snapshot.pulse_width,
        snapshot.peak_time,
        snapshot.hold_duty,
        snapshot.hold_freq,
        snapshot.pots.join(" ")
    )
}

fn print_line(kind: LineKind, message: &str) {
    let time = chrono::Local::now().format("%H:%M:%S");
    println!("[{}] {} {}", time, kind.marker(), message);
}

/// Print every decoded event and connection change until the session is dropped.
pub fn spawn_printer(session: &DeviceSession) -> JoinHandle<()> {
    let events = session.event_stream();
    let mut state = session.watch_state();

    tokio::spawn(async move {
        tokio::pin!(events);
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        let (kind, message) = describe_event(&event);
                        print_line(kind, &message);
                    }
                    None => break,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let message = match *state.borrow_and_update() {
                        ConnectionState::Connected => "Connected to device",
                        ConnectionState::Disconnected => "Disconnected from device",
                    };
                    print_line(LineKind::System, message);
                }
            }
        }
    })
}

/// Interactive loop over stdin. Returns when the operator quits or stdin ends.
pub async fn run(session: &DeviceSession, table: &CommandTable) -> anyhow::Result<()> {
    print_line(
        LineKind::System,
        "Type a command name, a raw token, 'pw <ms>', 'params', 'commands' or 'quit'",
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse_input(&line, table) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(e) => {
                print_line(LineKind::Error, &e.to_string());
                continue;
            }
        };

        let outcome = match input {
            ConsoleInput::Quit => break,
            ConsoleInput::Parameters => {
                print_line(LineKind::System, &format_parameters(&session.snapshot()));
                Ok(())
            }
            ConsoleInput::ListCommands => {
                for spec in table.commands() {
                    println!("  {:<20} {:<2} {}", spec.name, spec.token, spec.description);
                }
                Ok(())
            }
            ConsoleInput::PulseWidth(value) => {
                print_line(LineKind::Sent, &format!("pulse width {} ms", value));
                session.set_pulse_width(value.millis()).await
            }
            ConsoleInput::Token(token) => {
                let result = session.send_command(&token).await;
                if result.is_ok() {
                    print_line(LineKind::Sent, &token);
                }
                result
            }
        };

        if let Err(e) = outcome {
            print_line(LineKind::Error, &e.to_string());
        }
    }
    Ok(())
}
