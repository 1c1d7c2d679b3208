use std::time::Duration;

use crate::models::{parse_seconds, split_video_ids, IncomingMessage};

/// A remote-control command, decoded from a channel message. Commands with
/// unparseable arguments are rejected at decode time so the session can warn
/// and drop them without ever crashing.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    RemoteConnected { name: String, user: String },
    RemoteDisconnected { name: String, user: String },
    GetVolume,
    SetVolume { volume: i32 },
    ChangeVolume { delta: i32 },
    GetPlaylist,
    SetPlaylist {
        video_ids: Vec<String>,
        index: i32,
        position: Duration,
        list_id: String,
    },
    UpdatePlaylist {
        video_ids: Vec<String>,
        list_id: String,
    },
    SetVideo { video_id: String, position: Duration },
    GetNowPlaying,
    GetSubtitlesTrack,
    Pause,
    Play,
    SeekTo { position: Duration },
    StopVideo,
}

impl RemoteCommand {
    /// Decode a forwarded channel message. `Ok(None)` means the command is
    /// not one this receiver acts on (logged upstream, then dropped).
    pub fn decode(msg: &IncomingMessage) -> Result<Option<RemoteCommand>, String> {
        let arg = |key: &str| -> Result<String, String> {
            msg.arg(key)
                .map(str::to_string)
                .ok_or_else(|| format!("{}: missing argument '{}'", msg.command, key))
        };

        let cmd = match msg.command.as_str() {
            "remoteConnected" => RemoteCommand::RemoteConnected {
                name: msg.arg("name").unwrap_or_default().to_string(),
                user: msg.arg("user").unwrap_or_default().to_string(),
            },
            "remoteDisconnected" => RemoteCommand::RemoteDisconnected {
                name: msg.arg("name").unwrap_or_default().to_string(),
                user: msg.arg("user").unwrap_or_default().to_string(),
            },
            "getVolume" => RemoteCommand::GetVolume,
            "setVolume" => {
                // The app sends either an absolute volume or a delta.
                if let Some(v) = msg.arg("volume") {
                    RemoteCommand::SetVolume {
                        volume: v
                            .parse()
                            .map_err(|_| format!("setVolume: bad volume '{}'", v))?,
                    }
                } else {
                    let d = arg("delta")?;
                    RemoteCommand::ChangeVolume {
                        delta: d
                            .parse()
                            .map_err(|_| format!("setVolume: bad delta '{}'", d))?,
                    }
                }
            }
            "getPlaylist" => RemoteCommand::GetPlaylist,
            "setPlaylist" => {
                let ids = arg("videoIds")?;
                let index = arg("currentIndex")?;
                RemoteCommand::SetPlaylist {
                    video_ids: split_video_ids(&ids),
                    index: index
                        .parse()
                        .map_err(|_| format!("setPlaylist: bad index '{}'", index))?,
                    position: parse_seconds(&arg("currentTime")?),
                    list_id: msg.arg("listId").unwrap_or_default().to_string(),
                }
            }
            "updatePlaylist" => RemoteCommand::UpdatePlaylist {
                video_ids: split_video_ids(&arg("videoIds")?),
                list_id: msg.arg("listId").unwrap_or_default().to_string(),
            },
            "setVideo" => RemoteCommand::SetVideo {
                video_id: arg("videoId")?,
                position: parse_seconds(&arg("currentTime")?),
            },
            "getNowPlaying" => RemoteCommand::GetNowPlaying,
            "getSubtitlesTrack" => RemoteCommand::GetSubtitlesTrack,
            "pause" => RemoteCommand::Pause,
            "play" => RemoteCommand::Play,
            "seekTo" => RemoteCommand::SeekTo {
                position: parse_seconds(&arg("newTime")?),
            },
            "stopVideo" => RemoteCommand::StopVideo,
            _ => return Ok(None),
        };

        Ok(Some(cmd))
    }
}

/// One message queued for the next outbound batch POST.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub command: String,
    pub args: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(command: impl Into<String>) -> Self {
        OutgoingMessage {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }
}

/// Encode a batch as the bind POST form body:
/// `count=N&ofs=<ofs>` then `req<i>__sc=<command>` and `req<i>_<key>=<value>`
/// for each message, in enqueue order.
pub fn encode_batch(messages: &[OutgoingMessage], ofs: u64) -> String {
    let mut body = format!("count={}&ofs={}", messages.len(), ofs);
    for (i, msg) in messages.iter().enumerate() {
        body.push_str(&format!(
            "&req{}__sc={}",
            i,
            urlencoding::encode(&msg.command)
        ));
        for (key, value) in &msg.args {
            body.push_str(&format!(
                "&req{}_{}={}",
                i,
                urlencoding::encode(key),
                urlencoding::encode(value)
            ));
        }
    }
    body
}
