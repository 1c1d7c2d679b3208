use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::commands::{OutgoingMessage, RemoteCommand};
use crate::config::Store;
use crate::error::AppError;
use crate::models::{format_seconds, parse_seconds};
use crate::player::controller::{SnapshotSink, VolumeSink};
use crate::player::mpv::MpvBackend;
use crate::player::{Player, PlayerEvent, PlaylistSnapshot, State};
use crate::resolver::StreamResolver;
use crate::session::{LoungeSession, SCREEN_ID_KEY};
use crate::settings::SETTINGS;

/// An application hosted by the DIAL server.
#[async_trait]
pub trait App: Send + Sync {
    fn name(&self) -> &'static str;

    /// Launch (or re-target) the app with the DIAL POST body.
    async fn start(&self, post_data: &str);

    fn running(&self) -> bool;

    async fn quit(&self);

    /// Extra values exposed in the DIAL status document.
    fn data(&self, key: &str) -> Option<String>;
}

struct Running {
    session: LoungeSession,
    player: Player,
    // Held so teardown can be observed in tests; the task exits on its own
    // through the shutdown chain.
    _facade: JoinHandle<()>,
}

/// The YouTube receiver app: owns the lounge session and the playback
/// controller and translates between them. It keeps no state of its own
/// beyond the channels.
pub struct YouTubeApp {
    store: Arc<Store>,
    uuid: String,
    state: tokio::sync::Mutex<Option<Running>>,
}

impl YouTubeApp {
    pub fn new(store: Arc<Store>, uuid: String) -> YouTubeApp {
        YouTubeApp {
            store,
            uuid,
            state: tokio::sync::Mutex::new(None),
        }
    }

    async fn launch(&self, args: &HashMap<String, String>) -> Result<Running, AppError> {
        let backend = MpvBackend::spawn().await?;
        let resolver = StreamResolver::spawn()?;
        let (player, player_events) =
            Player::new(backend, resolver, self.store.clone()).await?;

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let session = LoungeSession::new(
            self.store.clone(),
            self.uuid.clone(),
            SETTINGS.friendly_name.clone(),
        );
        session.start(args.get("pairingCode").cloned(), commands_tx, outgoing_rx);

        apply_launch_video(&player, args);

        let facade = tokio::spawn(run_facade(
            player.clone(),
            commands_rx,
            player_events,
            outgoing_tx,
        ));

        Ok(Running {
            session,
            player,
            _facade: facade,
        })
    }
}

#[async_trait]
impl App for YouTubeApp {
    fn name(&self) -> &'static str {
        "YouTube"
    }

    async fn start(&self, post_data: &str) {
        info!("starting YouTube app: {}", post_data);
        let args = parse_query(post_data);

        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            // Already running: a second launch only re-targets playback.
            apply_launch_video(&running.player, &args);
            return;
        }

        match self.launch(&args).await {
            Ok(running) => *state = Some(running),
            Err(e) => error!("could not start YouTube app: {}", e),
        }
    }

    fn running(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => state
                .as_ref()
                .map(|r| r.session.running())
                .unwrap_or(false),
            // Start or quit in progress.
            Err(_) => true,
        }
    }

    async fn quit(&self) {
        let running = self.state.lock().await.take();
        if let Some(running) = running {
            info!("stopping YouTube app");
            // Stopping the session closes the inbound command stream; the
            // facade then quits the player, the backend closes its event
            // stream, and the outgoing queue drains last.
            running.session.stop();
            running.player.quit();
        }
    }

    fn data(&self, key: &str) -> Option<String> {
        match key {
            "screenId" => self.store.get(SCREEN_ID_KEY),
            _ => None,
        }
    }
}

// A DIAL launch may carry an initial video (v) and offset (t).
fn apply_launch_video(player: &Player, args: &HashMap<String, String>) {
    if let Some(video_id) = args.get("v") {
        if !video_id.is_empty() {
            let position = args.get("t").map(|t| parse_seconds(t)).unwrap_or_default();
            player.set_playstate(vec![video_id.clone()], 0, position, String::new());
        }
    }
}

/// Parse an application/x-www-form-urlencoded body.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map(|k| k.into_owned());
        let value = urlencoding::decode(&value.replace('+', " ")).map(|v| v.into_owned());
        if let (Ok(key), Ok(value)) = (key, value) {
            values.insert(key, value);
        }
    }
    values
}

// The translation loop between the lounge channel and the controller. The
// only component that knows both sides exist.
async fn run_facade(
    player: Player,
    mut commands: mpsc::Receiver<RemoteCommand>,
    mut events: mpsc::UnboundedReceiver<PlayerEvent>,
    outgoing: mpsc::UnboundedSender<OutgoingMessage>,
) {
    let (playlist_tx, mut playlist_rx) = watch::channel(None);
    let playlist_sink: SnapshotSink = Arc::new(playlist_tx);
    let (nowplaying_tx, mut nowplaying_rx) = watch::channel(None);
    let nowplaying_sink: SnapshotSink = Arc::new(nowplaying_tx);
    let (volume_tx, mut volume_rx) = watch::channel(None);
    let volume_sink: VolumeSink = Arc::new(volume_tx);

    let mut commands_open = true;
    loop {
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(command) => handle_command(
                    &player,
                    &outgoing,
                    &playlist_sink,
                    &nowplaying_sink,
                    &volume_sink,
                    command,
                ),
                None => {
                    // Session closed: begin the teardown chain.
                    commands_open = false;
                    player.quit();
                }
            },
            event = events.recv() => match event {
                Some(event) => handle_player_event(&player, &outgoing, &nowplaying_sink, event),
                // Controller exited after backend shutdown; dropping
                // `outgoing` below closes the sender.
                None => break,
            },
            _ = changed(&mut playlist_rx) => {
                let snapshot = playlist_rx.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    send_playlist(&outgoing, &snapshot);
                }
            },
            _ = changed(&mut nowplaying_rx) => {
                let snapshot = nowplaying_rx.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    send_now_playing(&outgoing, &snapshot);
                }
            },
            _ = changed(&mut volume_rx) => {
                let volume = *volume_rx.borrow_and_update();
                if let Some(volume) = volume {
                    send_volume(&outgoing, volume);
                }
            },
        }
    }
}

// The facade holds the matching sender, so this only resolves on updates.
async fn changed<T>(rx: &mut watch::Receiver<T>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn handle_command(
    player: &Player,
    outgoing: &mpsc::UnboundedSender<OutgoingMessage>,
    playlist_sink: &SnapshotSink,
    nowplaying_sink: &SnapshotSink,
    volume_sink: &VolumeSink,
    command: RemoteCommand,
) {
    match command {
        RemoteCommand::RemoteConnected { name, user } => {
            info!("remote connected: {} ({})", name, user);
            // The app does not always ask for the playlist; push it.
            player.request_playlist(playlist_sink.clone());
        }
        RemoteCommand::RemoteDisconnected { name, user } => {
            info!("remote disconnected: {} ({})", name, user);
        }
        RemoteCommand::GetVolume => player.request_volume(volume_sink.clone()),
        RemoteCommand::SetVolume { volume } => player.set_volume(volume),
        RemoteCommand::ChangeVolume { delta } => player.change_volume(delta),
        RemoteCommand::GetPlaylist => player.request_playlist(playlist_sink.clone()),
        RemoteCommand::SetPlaylist {
            video_ids,
            index,
            position,
            list_id,
        } => player.set_playstate(video_ids, index, position, list_id),
        RemoteCommand::UpdatePlaylist { video_ids, list_id } => {
            player.update_playlist(video_ids, list_id);
            let _ = outgoing.send(
                OutgoingMessage::new("confirmPlaylistUpdate").with_arg("updated", "true"),
            );
        }
        RemoteCommand::SetVideo { video_id, position } => player.set_video(video_id, position),
        RemoteCommand::GetNowPlaying => player.request_playlist(nowplaying_sink.clone()),
        RemoteCommand::GetSubtitlesTrack => {
            // No screen, no subtitles.
            let _ = outgoing
                .send(OutgoingMessage::new("onSubtitlesTrackChanged").with_arg("videoId", ""));
        }
        RemoteCommand::Pause => player.pause(),
        RemoteCommand::Play => player.play(),
        RemoteCommand::SeekTo { position } => player.seek(position),
        RemoteCommand::StopVideo => player.stop(),
    }
}

fn handle_player_event(
    player: &Player,
    outgoing: &mpsc::UnboundedSender<OutgoingMessage>,
    nowplaying_sink: &SnapshotSink,
    event: PlayerEvent,
) {
    match event {
        PlayerEvent::StateChange {
            state,
            position,
            duration,
        } => {
            if state == State::Buffering || state == State::Stopped {
                // Track identity may have changed; refresh the remote.
                player.request_playlist(nowplaying_sink.clone());
            }
            let _ = outgoing.send(
                OutgoingMessage::new("onStateChange")
                    .with_arg("currentTime", format_seconds(position))
                    .with_arg("duration", format_seconds(duration))
                    .with_arg("seekableStartTime", "0")
                    .with_arg("seekableEndTime", format_seconds(duration))
                    .with_arg("state", state.wire_code().to_string()),
            );
        }
        PlayerEvent::VolumeChange(volume) => send_volume(outgoing, volume),
    }
}

fn send_playlist(outgoing: &mpsc::UnboundedSender<OutgoingMessage>, snapshot: &PlaylistSnapshot) {
    let message = if snapshot.playlist.is_empty() {
        OutgoingMessage::new("nowPlayingPlaylist")
    } else {
        let video_id = match snapshot.playlist.get(snapshot.index) {
            Some(id) => id.clone(),
            None => {
                warn!("snapshot index out of range");
                return;
            }
        };
        OutgoingMessage::new("nowPlayingPlaylist")
            .with_arg("videoIds", snapshot.playlist.join(","))
            .with_arg("videoId", video_id)
            .with_arg("currentTime", format_seconds(snapshot.position))
            .with_arg("duration", format_seconds(snapshot.duration))
            .with_arg("state", snapshot.state.wire_code().to_string())
            .with_arg("currentIndex", snapshot.index.to_string())
    };
    let _ = outgoing.send(message);
}

fn send_now_playing(
    outgoing: &mpsc::UnboundedSender<OutgoingMessage>,
    snapshot: &PlaylistSnapshot,
) {
    let message = if snapshot.playlist.is_empty() {
        OutgoingMessage::new("nowPlaying")
    } else {
        let video_id = match snapshot.playlist.get(snapshot.index) {
            Some(id) => id.clone(),
            None => {
                warn!("snapshot index out of range");
                return;
            }
        };
        OutgoingMessage::new("nowPlaying")
            .with_arg("videoId", video_id)
            .with_arg("currentTime", format_seconds(snapshot.position))
            .with_arg("duration", format_seconds(snapshot.duration))
            .with_arg("seekableStartTime", "0")
            .with_arg("seekableEndTime", format_seconds(snapshot.duration))
            .with_arg("state", snapshot.state.wire_code().to_string())
            .with_arg("currentIndex", snapshot.index.to_string())
            .with_arg("listId", snapshot.list_id.clone())
    };
    let _ = outgoing.send(message);
}

fn send_volume(outgoing: &mpsc::UnboundedSender<OutgoingMessage>, volume: i32) {
    let _ = outgoing.send(
        OutgoingMessage::new("onVolumeChanged")
            .with_arg("volume", volume.to_string())
            .with_arg("muted", "false"),
    );
}
