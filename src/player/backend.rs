use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AppError;

/// Lifecycle events a backend reports. Backends are allowed to repeat
/// events and to emit extra ones around stop/load transitions; the
/// controller filters those out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    Playing,
    Paused,
    Stopped,
}

/// The narrow capability surface the controller needs from a media engine.
///
/// Property reads may take unbounded time around track boundaries, so the
/// controller only calls them from subtasks that do not hold the play state.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Performed once before any other call. Returns the stream of
    /// lifecycle events the backend will emit and the volume it has
    /// adopted.
    async fn initialize(&self) -> Result<(mpsc::Receiver<BackendEvent>, i32), AppError>;

    /// Begin playback of a stream URL at the given position. A
    /// non-negative volume is applied atomically with the load.
    async fn play(&self, url: &str, position: Duration, volume: i32);

    async fn pause(&self);

    async fn resume(&self);

    async fn stop(&self);

    /// Seek to an absolute position.
    async fn set_position(&self, position: Duration);

    /// May fail transiently around track boundaries (property unavailable).
    async fn get_position(&self) -> Result<Duration, AppError>;

    async fn get_duration(&self) -> Result<Duration, AppError>;

    /// `volume` is within 0..=100.
    async fn set_volume(&self, volume: i32);

    /// Terminate the engine; the event stream closes after this.
    async fn quit(&self);
}
