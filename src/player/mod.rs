// Media player core: a single-writer play state driven by remote commands
// and backend events.

pub mod backend;
pub mod controller;
pub mod mpv;

pub use backend::{Backend, BackendEvent};
pub use controller::Player;

use std::time::Duration;

pub const INITIAL_VOLUME: i32 = 80;

// These codes are defined by the YouTube API. SEEKING is receiver-internal
// and becomes BUFFERING on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
    Buffering = 3,
    Seeking = 4,
}

impl State {
    /// Numeric code as transmitted to the remote.
    pub fn wire_code(self) -> i32 {
        match self {
            State::Stopped => 0,
            State::Playing => 1,
            State::Paused => 2,
            // SEEKING does not exist in the protocol.
            State::Buffering | State::Seeking => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Stopped => "STOPPED",
            State::Playing => "PLAYING",
            State::Paused => "PAUSED",
            State::Buffering => "BUFFERING",
            State::Seeking => "SEEKING",
        }
    }
}

/// The authoritative playback record. Owned exclusively by the controller
/// mainloop; everything else observes it through snapshots and events.
#[derive(Debug, Clone)]
pub struct PlayState {
    pub playlist: Vec<String>,
    pub index: usize,
    pub list_id: String,
    pub state: State,
    /// State before the current one; the state restored after SEEKING.
    pub previous_state: State,
    /// Deferred pause/play arriving during SEEKING, applied when the
    /// backend next reports PLAYING.
    pub next_state: Option<State>,
    /// Valid exactly while state is BUFFERING or SEEKING.
    pub buffering_position: Option<Duration>,
    /// Last acknowledged volume; -1 until first known.
    pub volume: i32,
    /// Set when the backend has not yet been told about `volume`.
    pub new_volume: bool,
}

impl Default for PlayState {
    fn default() -> Self {
        PlayState {
            playlist: Vec::new(),
            index: 0,
            list_id: String::new(),
            state: State::Stopped,
            previous_state: State::Stopped,
            next_state: None,
            buffering_position: None,
            volume: -1,
            new_volume: false,
        }
    }
}

impl PlayState {
    /// The current video, or None if there is no playlist.
    pub fn video(&self) -> Option<&str> {
        self.playlist.get(self.index).map(String::as_str)
    }

    /// The next video in the playlist, if any.
    pub fn next_video(&self) -> Option<&str> {
        self.playlist.get(self.index + 1).map(String::as_str)
    }
}

/// Read-only copy of the playlist position, delivered through a 1-buffered
/// sink on request.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSnapshot {
    pub playlist: Vec<String>,
    pub index: usize,
    pub position: Duration,
    pub duration: Duration,
    pub state: State,
    pub list_id: String,
}

/// Events emitted by the controller towards the app facade.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChange {
        state: State,
        position: Duration,
        duration: Duration,
    },
    VolumeChange(i32),
}
