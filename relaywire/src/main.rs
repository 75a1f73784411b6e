//! `relaywire` -- line-oriented chat client.
//!
//! Reads commands from stdin and prints chat output to stdout. Logs go to a
//! file so they never interleave with the conversation.
//!
//! ```bash
//! cargo run --bin relaywire -- --relay-url ws://127.0.0.1:9000/ws --username alice
//! ```
//!
//! Plain lines are broadcast. Commands:
//!
//! - `/msg <user> <text>`: sealed direct message
//! - `/send <path>`: stream a file to everyone
//! - `/sendto <user> <path>`: stream a file sealed for one user
//! - `/voice <user> <path>`: send a recording as a voice transfer
//! - `/quit`

use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use relaywire::config::{CliArgs, ClientConfig};
use relaywire::events::{Event, EventKind};
use relaywire::supervisor::Supervisor;
use relaywire::transfer::{TransferDirection, TransferState};
use relaywire::transport::ws::WsConnector;
use relaywire_proto::frame::{MessageKind, is_voice_transfer};

type Client = Supervisor<WsConnector>;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();
    let config = ClientConfig::load(&cli).map_err(io::Error::other)?;

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("relaywire starting");

    let Some(relay_url) = config.relay_url.clone() else {
        return Err(io::Error::other("no relay URL; pass --relay-url or set RELAY_URL"));
    };
    let Some(supervisor_config) = config.to_supervisor_config() else {
        return Err(io::Error::other("no username; pass --username or set RELAYWIRE_USER"));
    };
    let connector =
        WsConnector::new(&relay_url, config.connect_timeout).map_err(io::Error::other)?;
    let client = Supervisor::new(supervisor_config, connector);

    let (out_tx, out_rx) = mpsc::channel(config.channel_capacity);
    wire_events(&client, &out_tx);
    let printer = tokio::spawn(print_output(out_rx));

    println!(
        "relaywire as {} ({}) via {relay_url}",
        client.username(),
        client.keys().local_identity().fingerprint()
    );
    if let Err(e) = client.connect().await {
        println!("could not connect ({e}); retrying in the background");
    }

    run_commands(&client, &out_tx).await?;

    client.close().await;
    printer.abort();
    tracing::info!("relaywire exiting");
    Ok(())
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// log lines are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("relaywire.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Something for the printer task to do.
#[derive(Debug)]
enum Output {
    Line(String),
    SaveFile { name: String, data: Vec<u8> },
}

fn wire_events(client: &Client, out: &mpsc::Sender<Output>) {
    for kind in [
        EventKind::MessageReceived,
        EventKind::UserListUpdated,
        EventKind::TransferProgress,
        EventKind::ConnectionLost,
        EventKind::Reconnected,
        EventKind::DecryptionFailed,
    ] {
        let out = out.clone();
        client.subscribe(kind, move |event| {
            if let Some(output) = render(event) {
                if out.try_send(output).is_err() {
                    tracing::warn!(?kind, "output queue full, dropping event");
                }
            }
        });
    }
}

fn render(event: &Event) -> Option<Output> {
    let line = match event {
        Event::MessageReceived {
            from, text, direct, ..
        } if *direct => format!("[dm] {from}: {text}"),
        Event::MessageReceived {
            text,
            kind: MessageKind::System,
            ..
        } => format!("* {text}"),
        Event::MessageReceived { from, text, .. } => format!("{from}: {text}"),
        Event::UserListUpdated { users } => format!("* online: {}", users.join(", ")),
        Event::ConnectionLost { reason } => format!("* connection lost ({reason}), reconnecting"),
        Event::Reconnected { attempts } => format!("* reconnected after {attempts} attempt(s)"),
        Event::DecryptionFailed { from, reason } => {
            format!("* could not decrypt message from {from}: {reason}")
        }
        Event::TransferProgress(update) => {
            let what = if is_voice_transfer(&update.name) {
                "voice message"
            } else {
                "file"
            };
            match (&update.state, update.direction) {
                (TransferState::Started, TransferDirection::Incoming) => format!(
                    "* receiving {what} {} ({} bytes) from {}",
                    update.name, update.total, update.peer
                ),
                (TransferState::Completed, TransferDirection::Incoming) => {
                    return Some(Output::SaveFile {
                        name: update.name.clone(),
                        data: update.data.clone().unwrap_or_default(),
                    });
                }
                (TransferState::Completed, TransferDirection::Outgoing) => {
                    format!("* sent {what} {} ({} bytes)", update.name, update.total)
                }
                (TransferState::Failed(reason), _) => {
                    format!("* {what} {} failed: {reason}", update.name)
                }
                _ => return None,
            }
        }
    };
    Some(Output::Line(line))
}

async fn print_output(mut rx: mpsc::Receiver<Output>) {
    let dir = dirs::download_dir().unwrap_or_else(std::env::temp_dir);
    while let Some(output) = rx.recv().await {
        match output {
            Output::Line(line) => println!("{line}"),
            Output::SaveFile { name, data } => {
                let path = dir.join(safe_file_name(&name));
                match tokio::fs::write(&path, &data).await {
                    Ok(()) => println!("* saved {} bytes to {}", data.len(), path.display()),
                    Err(e) => println!("* could not save {name}: {e}"),
                }
            }
        }
    }
}

/// Strip any directory components a peer put into a transfer name.
fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map_or_else(|| "received.bin".to_string(), ToString::to_string)
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Say(String),
    Direct { to: String, text: String },
    Send { path: PathBuf },
    SendTo { to: String, path: PathBuf },
    Voice { to: String, path: PathBuf },
    Quit,
    Invalid(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Say(line.to_string()));
        };

        let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
        let args = args.trim();
        let command = match name {
            "quit" | "q" => Self::Quit,
            "msg" => match split_target(args) {
                Some((to, text)) => Self::Direct { to, text },
                None => Self::Invalid("usage: /msg <user> <text>".into()),
            },
            "send" if !args.is_empty() => Self::Send { path: args.into() },
            "send" => Self::Invalid("usage: /send <path>".into()),
            "sendto" => match split_target(args) {
                Some((to, path)) => Self::SendTo { to, path: path.into() },
                None => Self::Invalid("usage: /sendto <user> <path>".into()),
            },
            "voice" => match split_target(args) {
                Some((to, path)) => Self::Voice { to, path: path.into() },
                None => Self::Invalid("usage: /voice <user> <path>".into()),
            },
            other => Self::Invalid(format!("unknown command /{other}")),
        };
        Some(command)
    }
}

fn split_target(args: &str) -> Option<(String, String)> {
    let (to, rest) = args.split_once(' ')?;
    let rest = rest.trim();
    (!to.is_empty() && !rest.is_empty()).then(|| (to.to_string(), rest.to_string()))
}

async fn run_commands(client: &Client, out: &mpsc::Sender<Output>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        let result = match command {
            Command::Quit => break,
            Command::Invalid(message) => {
                let _ = out.send(Output::Line(format!("* {message}"))).await;
                continue;
            }
            Command::Say(text) => client.send_message(&text).await.map_err(|e| e.to_string()),
            Command::Direct { to, text } => {
                client.send_direct(&to, &text).await.map_err(|e| e.to_string())
            }
            Command::Send { path } => {
                spawn_transfer(client.clone(), None, path, false, out.clone());
                Ok(())
            }
            Command::SendTo { to, path } => {
                spawn_transfer(client.clone(), Some(to), path, false, out.clone());
                Ok(())
            }
            Command::Voice { to, path } => {
                spawn_transfer(client.clone(), Some(to), path, true, out.clone());
                Ok(())
            }
        };
        if let Err(e) = result {
            let _ = out.send(Output::Line(format!("* not sent: {e}"))).await;
        }
    }
    Ok(())
}

/// Stream a file in the background so chat keeps working meanwhile.
fn spawn_transfer(
    client: Client,
    to: Option<String>,
    path: PathBuf,
    voice: bool,
    out: mpsc::Sender<Output>,
) {
    tokio::spawn(async move {
        let result: Result<(), String> = async {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| format!("{}: {e}", path.display()))?;
            let size = file
                .metadata()
                .await
                .map_err(|e| format!("{}: {e}", path.display()))?
                .len();
            let name = safe_file_name(&path.to_string_lossy());
            let sent = match (to, voice) {
                (Some(to), true) => client.send_voice(&to, file, size).await.map(|_| ()),
                (Some(to), false) => client.send_file_to(&to, &name, file, size).await.map(|_| ()),
                (None, _) => client.send_file(&name, file, size).await.map(|_| ()),
            };
            sent.map_err(|e| e.to_string())
        }
        .await;
        if let Err(e) = result {
            let _ = out.send(Output::Line(format!("* transfer not sent: {e}"))).await;
        }
    });
}
