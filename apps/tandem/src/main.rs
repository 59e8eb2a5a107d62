use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use serde_json::json;
use tandem_client::cli::{parse_input, Cli, Input, HELP};
use tandem_client::media::{MediaConstraints, MediaKind, SyntheticMediaSource};
use tandem_client::orchestrator::rtc::WebRtcConnector;
use tandem_client::transport::{Content, Message, Sender};
use tandem_client::{Orchestrator, SessionCommand, SessionEvent, SessionSettings, SignalingClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("tandem: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config();
    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("creating {}", config.download_dir.display()))?;

    let (signaling, server_events) = SignalingClient::connect(&config.server_url)
        .await
        .with_context(|| format!("connecting to {}", config.server_url))?;
    info!("Connected to signaling relay at {}", signaling.url());

    let settings = SessionSettings {
        transfer: config.transfer,
        trickle: config.trickle,
        constraints: MediaConstraints::default(),
    };
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(
        cli.room.clone(),
        settings,
        Arc::new(SyntheticMediaSource::new(cli.audio, cli.video)),
        Arc::new(WebRtcConnector::new(config.rtc())),
        signaling.sender(),
        events_tx,
    );
    let session = tokio::spawn(orchestrator.run(server_events, commands_rx));
    let input = tokio::spawn(read_prompt(commands.clone()));

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let finished = matches!(
                    event,
                    SessionEvent::Left | SessionEvent::Disconnected | SessionEvent::RoomFull
                );
                if matches!(event, SessionEvent::PeerConnected) {
                    if let Some(name) = &cli.name {
                        let _ = commands.send(SessionCommand::SendControl(
                            json!({"type": "display-name", "name": name}),
                        ));
                    }
                }
                display(event, &config.download_dir).await;
                if finished {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; leaving room");
                let _ = commands.send(SessionCommand::Leave);
            }
        }
    }

    input.abort();
    drop(commands);
    match session.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("session ended with error: {}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!("session task failed: {}", e),
    }
    signaling.shutdown().await;
    Ok(())
}

async fn read_prompt(commands: mpsc::UnboundedSender<SessionCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin read failed: {}", e);
                break;
            }
        };
        let command = match parse_input(&line) {
            Ok(Some(input)) => match to_command(input).await {
                Some(command) => command,
                None => continue,
            },
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        let leaving = matches!(command, SessionCommand::Leave);
        if commands.send(command).is_err() || leaving {
            break;
        }
    }
    debug!("prompt reader finished");
}

async fn to_command(input: Input) -> Option<SessionCommand> {
    match input {
        Input::Chat(text) => Some(SessionCommand::SendChat(text)),
        Input::File(path) => {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            match tokio::fs::read(&path).await {
                Ok(bytes) => Some(SessionCommand::SendFile {
                    file_name,
                    bytes: Bytes::from(bytes),
                }),
                Err(e) => {
                    println!("cannot read {}: {}", path.display(), e);
                    None
                }
            }
        }
        Input::Mute {
            kind: MediaKind::Audio,
            muted,
        } => Some(SessionCommand::SetAudioMuted(muted)),
        Input::Mute {
            kind: MediaKind::Video,
            muted,
        } => Some(SessionCommand::SetVideoMuted(muted)),
        Input::Switch(constraints) => Some(SessionCommand::ReplaceMedia(constraints)),
        Input::Leave => Some(SessionCommand::Leave),
        Input::Help => {
            println!("{HELP}");
            None
        }
    }
}

async fn display(event: SessionEvent, download_dir: &Path) {
    match event {
        SessionEvent::Admitted { is_host: true } => println!("* created room; waiting for a peer"),
        SessionEvent::Admitted { is_host: false } => println!("* joined room"),
        SessionEvent::RoomFull => println!("* room is full"),
        SessionEvent::HostChanged { .. } => println!("* you are now the host"),
        SessionEvent::PeerConnected => println!("* peer connected"),
        SessionEvent::PeerLeft => println!("* peer left"),
        SessionEvent::ConnectionLost => println!("* connection to peer lost"),
        SessionEvent::RemoteTrack(kind) => println!("* receiving {kind}"),
        SessionEvent::MediaReplaced => println!("* media switched"),
        SessionEvent::Message(Message::Text { sender, content }) => match sender {
            Sender::Me => println!("you: {content}"),
            Sender::Peer => println!("peer: {content}"),
        },
        SessionEvent::Message(Message::File {
            sender: Sender::Me,
            file_name,
            size,
            ..
        }) => println!("* sent {file_name} ({size} bytes)"),
        SessionEvent::Message(Message::File {
            sender: Sender::Peer,
            file_name,
            size,
            content,
        }) => match save_download(download_dir, &file_name, &content).await {
            Ok(path) => println!("* received {file_name} ({size} bytes) -> {}", path.display()),
            Err(e) => println!("* received {file_name} but could not save it: {e:#}"),
        },
        SessionEvent::Control(value) => {
            if value["type"] == "display-name" {
                if let Some(name) = value["name"].as_str() {
                    println!("* peer is {name}");
                    return;
                }
            }
            debug!(envelope = %value, "control envelope");
        }
        SessionEvent::MediaSourceChange(payload) | SessionEvent::MediaSourceAnswer(payload) => {
            debug!(%payload, "media source notice");
        }
        SessionEvent::TransferProgress { file_name, percent } => {
            println!("* {file_name}: {percent}%")
        }
        SessionEvent::TransferFailed { file_name, reason } => {
            println!("* {file_name}: {reason}")
        }
        SessionEvent::Error(message) => println!("! {message}"),
        SessionEvent::Disconnected => println!("* signaling connection lost"),
        SessionEvent::Left => println!("* left room"),
    }
}

async fn save_download(dir: &Path, file_name: &str, content: &Content) -> Result<PathBuf> {
    let bytes = content.bytes().context("file content no longer available")?;
    let path = dir.join(sanitize_file_name(file_name));
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "download".to_string(),
        trimmed => trimmed.to_string(),
    }
}
