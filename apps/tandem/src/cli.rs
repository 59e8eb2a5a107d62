use std::path::PathBuf;

use clap::Parser;

use crate::config::ClientConfig;
use crate::media::{MediaConstraints, MediaKind};
use crate::transport::DeviceClass;

#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(about = "Join a Tandem room for a peer-to-peer call with chat and file sharing")]
pub struct Cli {
    /// Room to join (created if nobody is in it yet)
    pub room: String,

    /// Signaling relay URL (overrides TANDEM_SERVER_URL)
    #[arg(long, short)]
    pub server: Option<String>,

    /// Transfer tuning profile: desktop or constrained
    #[arg(long, env = "TANDEM_DEVICE_CLASS", default_value = "desktop")]
    pub device_class: DeviceClass,

    /// Directory received files are written to
    #[arg(long, default_value = ".")]
    pub download_dir: PathBuf,

    /// Relay ICE candidates as they are gathered
    #[arg(long)]
    pub trickle: bool,

    /// Attach an outgoing audio track
    #[arg(long)]
    pub audio: bool,

    /// Attach an outgoing video track
    #[arg(long)]
    pub video: bool,

    /// Name announced to the peer once connected
    #[arg(long)]
    pub name: Option<String>,
}

impl Cli {
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_env(self.device_class);
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        config.trickle = self.trickle;
        config.download_dir = self.download_dir.clone();
        config
    }
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    File(PathBuf),
    Mute { kind: MediaKind, muted: bool },
    Switch(MediaConstraints),
    Leave,
    Help,
}

pub const HELP: &str = "\
commands:
  /file <path>                  send a file
  /mute audio|video             stop sending a track
  /unmute audio|video           resume a track
  /switch audio|video <device>  swap to another input device
  /leave                        leave the room
anything else is sent as chat";

/// Parses a prompt line. Blank lines yield `Ok(None)`.
pub fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Input::Chat(line.to_string())));
    };
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let input = match name {
        "file" if !rest.is_empty() => Input::File(PathBuf::from(rest)),
        "file" => return Err("usage: /file <path>".into()),
        "mute" | "unmute" => Input::Mute {
            kind: parse_kind(rest)?,
            muted: name == "mute",
        },
        "switch" => {
            let (kind, device) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: /switch audio|video <device>".to_string())?;
            let device = Some(device.trim().to_string());
            let constraints = match parse_kind(kind)? {
                MediaKind::Audio => MediaConstraints {
                    audio_device: device,
                    ..MediaConstraints::default()
                },
                MediaKind::Video => MediaConstraints {
                    video_device: device,
                    ..MediaConstraints::default()
                },
            };
            Input::Switch(constraints)
        }
        "leave" | "quit" => Input::Leave,
        "help" => Input::Help,
        other => return Err(format!("unknown command /{other}; try /help")),
    };
    Ok(Some(input))
}

fn parse_kind(value: &str) -> Result<MediaKind, String> {
    match value.trim() {
        "audio" | "mic" => Ok(MediaKind::Audio),
        "video" | "camera" => Ok(MediaKind::Video),
        other => Err(format!("expected audio or video, got `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(
            parse_input("  hello there ").unwrap(),
            Some(Input::Chat("hello there".into()))
        );
        assert_eq!(parse_input("   ").unwrap(), None);
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(
            parse_input("/file ./notes final.txt").unwrap(),
            Some(Input::File(PathBuf::from("./notes final.txt")))
        );
        assert_eq!(
            parse_input("/mute video").unwrap(),
            Some(Input::Mute {
                kind: MediaKind::Video,
                muted: true
            })
        );
        assert_eq!(
            parse_input("/unmute audio").unwrap(),
            Some(Input::Mute {
                kind: MediaKind::Audio,
                muted: false
            })
        );
        assert_eq!(parse_input("/leave").unwrap(), Some(Input::Leave));
    }

    #[test]
    fn switch_targets_one_device() {
        let Some(Input::Switch(constraints)) = parse_input("/switch video usb-cam").unwrap() else {
            panic!("expected switch");
        };
        assert_eq!(constraints.video_device.as_deref(), Some("usb-cam"));
        assert_eq!(constraints.audio_device, None);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(parse_input("/file").is_err());
        assert!(parse_input("/mute screen").is_err());
        assert!(parse_input("/switch video").is_err());
        assert!(parse_input("/dance").is_err());
    }

    #[test]
    fn cli_maps_into_client_config() {
        let cli = Cli::parse_from([
            "tandem",
            "standup",
            "--server",
            "ws://relay.test:9000",
            "--device-class",
            "constrained",
            "--trickle",
        ]);
        let config = cli.config();
        assert_eq!(cli.room, "standup");
        assert_eq!(config.server_url, "ws://relay.test:9000");
        assert_eq!(config.device_class, DeviceClass::Constrained);
        assert!(config.trickle);
    }
}
