use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Store;
use crate::error::AppError;
use crate::player::backend::{Backend, BackendEvent};
use crate::player::{PlayState, PlayerEvent, PlaylistSnapshot, State};
use crate::resolver::StreamResolver;

pub const VOLUME_KEY: &str = "apps.youtube.volume";

const PREFETCH_DELAY: Duration = Duration::from_secs(10);

/// 1-buffered latest-wins sink for playlist snapshots: an unread snapshot
/// is replaced by a newer one, and the controller never blocks on it.
pub type SnapshotSink = Arc<watch::Sender<Option<PlaylistSnapshot>>>;
pub type VolumeSink = Arc<watch::Sender<Option<i32>>>;

// Mailbox commands. Public operations map onto the first group; the second
// group are continuations re-entering the mainloop from subtasks.
enum Cmd {
    SetPlaystate {
        playlist: Vec<String>,
        index: i32,
        position: Duration,
        list_id: String,
    },
    UpdatePlaylist {
        playlist: Vec<String>,
        list_id: String,
    },
    SetVideo {
        video_id: String,
        position: Duration,
    },
    Pause,
    Play,
    Seek(Duration),
    SetVolume(i32),
    ChangeVolume(i32),
    RequestPlaylist(SnapshotSink),
    RequestVolume(VolumeSink),
    Stop,
    Quit,

    StreamLoaded {
        video_id: String,
        url: String,
        position: Duration,
    },
    PrefetchDue {
        video_id: String,
    },
}

/// Handle to the playback controller. All operations are non-blocking with
/// respect to the caller: they enqueue a command for the mainloop, which is
/// the sole mutator of the play state.
#[derive(Clone)]
pub struct Player {
    cmds: mpsc::UnboundedSender<Cmd>,
}

impl Player {
    /// Initialize the backend and start the controller mainloop. The
    /// returned receiver carries state-change and volume events.
    pub async fn new(
        backend: Arc<dyn Backend>,
        resolver: Arc<StreamResolver>,
        store: Arc<Store>,
    ) -> Result<(Player, mpsc::UnboundedReceiver<PlayerEvent>), AppError> {
        let (backend_events, initial_volume) = backend.initialize().await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let persisted_volume = store
            .get(VOLUME_KEY)
            .and_then(|s| s.parse::<i32>().ok())
            .map(|v| v.clamp(0, 100));

        let mainloop = Mainloop {
            backend,
            resolver,
            store,
            cmds: cmd_tx.clone(),
            events: event_tx,
            initial_volume,
            persisted_volume,
            quitting: false,
        };
        tokio::spawn(mainloop.run(cmd_rx, backend_events));

        Ok((Player { cmds: cmd_tx }, event_rx))
    }

    fn send(&self, cmd: Cmd) {
        // The mainloop outlives every handle except during quit, where
        // late commands are intentionally dropped.
        let _ = self.cmds.send(cmd);
    }

    /// Replace the playlist and start playing at (index, position). If the
    /// same track is already buffering at that position, only the playlist
    /// is refreshed.
    pub fn set_playstate(
        &self,
        playlist: Vec<String>,
        index: i32,
        position: Duration,
        list_id: String,
    ) {
        self.send(Cmd::SetPlaystate {
            playlist,
            index,
            position,
            list_id,
        });
    }

    /// Replace the playlist without interrupting playback, retaining the
    /// current track when it is still present.
    pub fn update_playlist(&self, playlist: Vec<String>, list_id: String) {
        self.send(Cmd::UpdatePlaylist { playlist, list_id });
    }

    /// Jump to a video of the current playlist and play it.
    pub fn set_video(&self, video_id: String, position: Duration) {
        self.send(Cmd::SetVideo { video_id, position });
    }

    pub fn pause(&self) {
        self.send(Cmd::Pause);
    }

    pub fn play(&self) {
        self.send(Cmd::Play);
    }

    pub fn seek(&self, position: Duration) {
        self.send(Cmd::Seek(position));
    }

    pub fn set_volume(&self, volume: i32) {
        self.send(Cmd::SetVolume(volume));
    }

    pub fn change_volume(&self, delta: i32) {
        self.send(Cmd::ChangeVolume(delta));
    }

    /// Deliver one playlist snapshot to the sink; an unread older snapshot
    /// is overwritten.
    pub fn request_playlist(&self, sink: SnapshotSink) {
        self.send(Cmd::RequestPlaylist(sink));
    }

    pub fn request_volume(&self, sink: VolumeSink) {
        self.send(Cmd::RequestVolume(sink));
    }

    /// Clear the playlist (the index is kept for a later update) and stop
    /// the backend.
    pub fn stop(&self) {
        self.send(Cmd::Stop);
    }

    /// Shut down the backend and the resolver. No further operations are
    /// valid afterwards.
    pub fn quit(&self) {
        self.send(Cmd::Quit);
    }
}

struct Mainloop {
    backend: Arc<dyn Backend>,
    resolver: Arc<StreamResolver>,
    store: Arc<Store>,
    cmds: mpsc::UnboundedSender<Cmd>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    initial_volume: i32,
    persisted_volume: Option<i32>,
    quitting: bool,
}

impl Mainloop {
    async fn run(
        mut self,
        mut cmds: mpsc::UnboundedReceiver<Cmd>,
        mut backend_events: mpsc::Receiver<BackendEvent>,
    ) {
        let mut ps = PlayState::default();

        if let Some(volume) = self.persisted_volume {
            // Tell the backend once playback starts.
            ps.volume = volume;
            ps.new_volume = true;
        }

        let mut cmds_open = true;
        loop {
            tokio::select! {
                cmd = cmds.recv(), if cmds_open => match cmd {
                    Some(cmd) => self.handle_command(&mut ps, cmd).await,
                    None => {
                        cmds_open = false;
                        self.begin_quit().await;
                    }
                },
                event = backend_events.recv() => match event {
                    Some(event) => self.handle_backend_event(&mut ps, event).await,
                    // The backend closed its event stream: it has quit, and
                    // with it this mainloop. The player event channel closes
                    // here, after the backend is gone.
                    None => break,
                },
            }
        }
    }

    async fn handle_command(&mut self, ps: &mut PlayState, cmd: Cmd) {
        match cmd {
            Cmd::SetPlaystate {
                playlist,
                index,
                position,
                list_id,
            } => self.set_playstate(ps, playlist, index, position, list_id).await,
            Cmd::UpdatePlaylist { playlist, list_id } => {
                self.update_playlist(ps, playlist, list_id).await
            }
            Cmd::SetVideo { video_id, position } => {
                self.set_video(ps, &video_id, position).await
            }
            Cmd::Pause => self.pause(ps).await,
            Cmd::Play => self.play(ps).await,
            Cmd::Seek(position) => self.seek(ps, position).await,
            Cmd::SetVolume(volume) => self.apply_volume(ps, volume).await,
            Cmd::ChangeVolume(delta) => {
                let current = if ps.volume < 0 {
                    self.initial_volume
                } else {
                    ps.volume
                };
                self.apply_volume(ps, current + delta).await;
            }
            Cmd::RequestPlaylist(sink) => self.snapshot(ps, sink),
            Cmd::RequestVolume(sink) => {
                let volume = if ps.volume < 0 {
                    self.initial_volume
                } else {
                    ps.volume
                };
                let _ = sink.send(Some(volume));
            }
            Cmd::Stop => self.stop(ps).await,
            Cmd::Quit => self.begin_quit().await,
            Cmd::StreamLoaded {
                video_id,
                url,
                position,
            } => self.stream_loaded(ps, &video_id, url, position).await,
            Cmd::PrefetchDue { video_id } => {
                if ps.next_video() == Some(video_id.as_str()) {
                    self.resolver.prefetch(&video_id);
                } else {
                    debug!("next video changed, not prefetching {}", video_id);
                }
            }
        }
    }

    async fn set_playstate(
        &mut self,
        ps: &mut PlayState,
        playlist: Vec<String>,
        index: i32,
        position: Duration,
        list_id: String,
    ) {
        if playlist.is_empty() {
            ps.list_id = list_id;
            self.stop(ps).await;
            return;
        }

        let mut index = index;
        if index < 0 || index as usize >= playlist.len() {
            warn!(
                "playlist index {} out of range for {} videos, clamping",
                index,
                playlist.len()
            );
            index = playlist.len() as i32 - 1;
        }
        let index = index as usize;

        // The remote re-sends the play state while we are already loading
        // that exact track; only the playlist may have changed.
        if ps.state == State::Buffering
            && ps.buffering_position == Some(position)
            && ps.video() == Some(playlist[index].as_str())
        {
            self.update_playlist(ps, playlist, list_id).await;
            return;
        }

        ps.playlist = playlist;
        ps.index = index;
        ps.list_id = list_id;
        self.start_playing(ps, position).await;
    }

    async fn update_playlist(&mut self, ps: &mut PlayState, playlist: Vec<String>, list_id: String) {
        ps.list_id = list_id;

        if ps.playlist.is_empty() {
            if ps.state == State::Playing {
                // impossible by the state invariants
                panic!("empty playlist while playing");
            }
            ps.playlist = playlist;
            if ps.playlist.is_empty() {
                return;
            }
            if ps.index >= ps.playlist.len() {
                // this appears to be the normal behavior of YouTube
                ps.index = ps.playlist.len() - 1;
            }
            if ps.state == State::Stopped {
                self.start_playing(ps, Duration::ZERO).await;
            }
            return;
        }

        let current = ps.playlist[ps.index].clone();

        if playlist.is_empty() {
            if ps.state == State::Playing {
                panic!("empty playlist while playing");
            }
            // Keep the index: it may be needed by a follow-up update, as
            // when the currently playing video is removed from the list.
            ps.playlist = playlist;
            return;
        }

        ps.playlist = playlist;
        match find_video(&ps.playlist, &current) {
            Some(index) => ps.index = index,
            None => {
                ps.index = ps.index.min(ps.playlist.len() - 1);
                if ps.video() != Some(current.as_str()) && ps.state != State::Stopped {
                    // The current track no longer exists; stop and let the
                    // remote re-issue playback for its replacement.
                    info!("current video {} dropped from playlist, stopping", current);
                    self.backend.stop().await;
                    self.set_play_state(ps, State::Stopped, Some(Duration::ZERO));
                }
            }
        }
    }

    async fn set_video(&mut self, ps: &mut PlayState, video_id: &str, position: Duration) {
        if ps.playlist.is_empty() {
            warn!("setVideo {} without a playlist", video_id);
            return;
        }
        match find_video(&ps.playlist, video_id) {
            Some(index) => ps.index = index,
            None => {
                warn!("video {} not in playlist, keeping a safe index", video_id);
                ps.index = ps.index.min(ps.playlist.len() - 1);
            }
        }
        self.start_playing(ps, position).await;
    }

    async fn pause(&mut self, ps: &mut PlayState) {
        match ps.state {
            State::Playing => self.backend.pause().await,
            // Applied when the backend reports PLAYING after the seek.
            State::Seeking => ps.next_state = Some(State::Paused),
            state => warn!("pause while in state {}", state.as_str()),
        }
    }

    async fn play(&mut self, ps: &mut PlayState) {
        match ps.state {
            State::Paused => self.backend.resume().await,
            State::Seeking => ps.next_state = Some(State::Playing),
            state => warn!("play while in state {}", state.as_str()),
        }
    }

    async fn seek(&mut self, ps: &mut PlayState, position: Duration) {
        match ps.state {
            State::Playing | State::Paused => {
                self.set_play_state(ps, State::Seeking, Some(position));
                self.backend.set_position(position).await;
            }
            State::Stopped => {
                // A seek with no track loaded starts playback there.
                if ps.video().is_none() {
                    warn!("seek while stopped without a playlist");
                    return;
                }
                self.start_playing(ps, position).await;
            }
            State::Buffering | State::Seeking => {
                ps.buffering_position = Some(position);
                self.backend.set_position(position).await;
            }
        }
    }

    async fn apply_volume(&mut self, ps: &mut PlayState, volume: i32) {
        let volume = volume.clamp(0, 100);
        if volume == ps.volume {
            return;
        }
        ps.volume = volume;

        match ps.state {
            State::Playing | State::Paused => {
                self.backend.set_volume(volume).await;
                ps.new_volume = false;
            }
            // Pushed by the first PLAYING event.
            _ => ps.new_volume = true,
        }

        let _ = self.events.send(PlayerEvent::VolumeChange(volume));
        if let Err(e) = self.store.set(VOLUME_KEY, &volume.to_string()) {
            warn!("could not persist volume: {}", e);
        }
    }

    async fn stop(&mut self, ps: &mut PlayState) {
        // Do not reset the index: Stop is called before UpdatePlaylist when
        // removing the currently playing video from the playlist.
        ps.playlist = Vec::new();
        self.backend.stop().await;
        if ps.state != State::Stopped {
            self.set_play_state(ps, State::Stopped, Some(Duration::ZERO));
        }
    }

    async fn begin_quit(&mut self) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        self.backend.quit().await;
        self.resolver.shutdown();
    }

    async fn stream_loaded(
        &mut self,
        ps: &mut PlayState,
        video_id: &str,
        url: String,
        position: Duration,
    ) {
        // The user may have moved on while the resolver was working.
        if ps.video() != Some(video_id) {
            info!("dropping stale stream for {}", video_id);
            return;
        }

        if url.is_empty() {
            warn!("no stream for {}, treating as end of track", video_id);
            self.end_of_track(ps).await;
            return;
        }

        let volume = if ps.new_volume && ps.volume >= 0 {
            ps.new_volume = false;
            ps.volume
        } else {
            -1
        };
        self.backend.play(&url, position, volume).await;
    }

    async fn start_playing(&mut self, ps: &mut PlayState, position: Duration) {
        self.set_play_state(ps, State::Buffering, Some(position));

        let video_id = match ps.video() {
            Some(id) => id.to_string(),
            None => {
                error!("start_playing without a current video");
                return;
            }
        };

        // Resolution can take seconds; re-enter the mainloop when done.
        let resolver = self.resolver.clone();
        let cmds = self.cmds.clone();
        tokio::spawn(async move {
            let url = resolver.resolve(&video_id).await;
            let _ = cmds.send(Cmd::StreamLoaded {
                video_id,
                url,
                position,
            });
        });
    }

    async fn handle_backend_event(&mut self, ps: &mut PlayState, event: BackendEvent) {
        let event_state = match event {
            BackendEvent::Playing => State::Playing,
            BackendEvent::Paused => State::Paused,
            BackendEvent::Stopped => State::Stopped,
        };
        if event_state == ps.state {
            // backends repeat themselves; ignore
            return;
        }

        match event {
            BackendEvent::Playing => match ps.state {
                State::Stopped => {
                    // post-stop noise from the backend
                    debug!("ignoring PLAYING while stopped");
                }
                State::Seeking => {
                    let target = ps.next_state.take().unwrap_or(ps.previous_state);
                    let position = ps.buffering_position;
                    self.set_play_state(ps, target, position);
                    if target == State::Paused {
                        // maintain the paused intent across the seek
                        self.backend.pause().await;
                    }
                }
                State::Buffering => {
                    self.set_play_state(ps, State::Playing, None);
                    self.push_pending_volume(ps).await;
                    self.schedule_prefetch(ps);
                }
                State::Paused => {
                    self.set_play_state(ps, State::Playing, None);
                }
                State::Playing => unreachable!(),
            },

            BackendEvent::Paused => match ps.state {
                State::Playing => self.set_play_state(ps, State::Paused, None),
                // A pause surfacing mid-seek becomes the post-seek state.
                State::Seeking => ps.next_state = Some(State::Paused),
                state => debug!("ignoring PAUSED while {}", state.as_str()),
            },

            BackendEvent::Stopped => match ps.state {
                State::Buffering => {
                    // The previous track's teardown as the new one loads.
                    debug!("ignoring STOPPED while buffering");
                }
                State::Playing | State::Paused | State::Seeking => {
                    self.end_of_track(ps).await;
                }
                State::Stopped => unreachable!(),
            },
        }
    }

    async fn end_of_track(&mut self, ps: &mut PlayState) {
        if ps.index + 1 < ps.playlist.len() {
            ps.index += 1;
            self.start_playing(ps, Duration::ZERO).await;
        } else {
            // The position resets instead of staying at track end.
            self.set_play_state(ps, State::Stopped, Some(Duration::ZERO));
        }
    }

    async fn push_pending_volume(&mut self, ps: &mut PlayState) {
        if ps.volume < 0 {
            // adopt the backend's own volume on first playback
            ps.volume = self.initial_volume;
            let _ = self.events.send(PlayerEvent::VolumeChange(ps.volume));
            return;
        }
        if ps.new_volume {
            ps.new_volume = false;
            self.backend.set_volume(ps.volume).await;
            let _ = self.events.send(PlayerEvent::VolumeChange(ps.volume));
        }
    }

    fn schedule_prefetch(&self, ps: &PlayState) {
        let next = match ps.next_video() {
            Some(next) => next.to_string(),
            None => return,
        };
        let cmds = self.cmds.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PREFETCH_DELAY).await;
            let _ = cmds.send(Cmd::PrefetchDue { video_id: next });
        });
    }

    // Transition the state, fix up the buffering position, and emit a
    // state-change event. A None position is read from the backend in a
    // subtask so the mainloop never waits on a property.
    fn set_play_state(&self, ps: &mut PlayState, state: State, position: Option<Duration>) {
        if state == ps.state {
            warn!("state {} did not change", state.as_str());
        }
        ps.previous_state = ps.state;
        ps.state = state;
        ps.buffering_position = match state {
            State::Buffering | State::Seeking => Some(position.unwrap_or(Duration::ZERO)),
            _ => None,
        };

        let backend = self.backend.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let position = match position {
                Some(position) => position,
                None => backend.get_position().await.unwrap_or(Duration::ZERO),
            };
            let duration = backend.get_duration().await.unwrap_or(Duration::ZERO);
            let _ = events.send(PlayerEvent::StateChange {
                state,
                position,
                duration,
            });
        });
    }

    // Deliver a snapshot without blocking the mainloop on property reads.
    fn snapshot(&self, ps: &PlayState, sink: SnapshotSink) {
        let playlist = ps.playlist.clone();
        let index = ps.index;
        let state = ps.state;
        let list_id = ps.list_id.clone();

        let fixed_position = match ps.state {
            State::Stopped => Some(Duration::ZERO),
            State::Buffering | State::Seeking => {
                Some(ps.buffering_position.unwrap_or(Duration::ZERO))
            }
            _ => None,
        };

        let backend = self.backend.clone();
        tokio::spawn(async move {
            let position = match fixed_position {
                Some(position) => position,
                None => backend.get_position().await.unwrap_or(Duration::ZERO),
            };
            let duration = backend.get_duration().await.unwrap_or(Duration::ZERO);
            let _ = sink.send(Some(PlaylistSnapshot {
                playlist,
                index,
                position,
                duration,
                state,
                list_id,
            }));
        });
    }
}

// Locate a video in a playlist. A unique match wins; duplicates warn and
// take the first occurrence; absence is reported to the caller.
fn find_video(playlist: &[String], video_id: &str) -> Option<usize> {
    let mut found = None;
    for (i, v) in playlist.iter().enumerate() {
        if v == video_id {
            if found.is_some() {
                warn!("video {} exists twice in playlist", video_id);
                break;
            }
            found = Some(i);
            // keep scanning so duplicates are detected
        }
    }
    found
}
