mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use common::{echo_resolver, shell_resolver, Call, MockBackend};
use loungecast::config::Store;
use loungecast::player::controller::VOLUME_KEY;
use loungecast::player::{BackendEvent, Player, PlayerEvent, PlaylistSnapshot, State};
use loungecast::resolver::StreamResolver;

const WAIT: Duration = Duration::from_secs(5);

async fn new_player(
    backend: Arc<MockBackend>,
    resolver: Arc<StreamResolver>,
) -> (
    Player,
    mpsc::UnboundedReceiver<PlayerEvent>,
    Arc<Store>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("config.json")).unwrap());
    let (player, events) = Player::new(backend, resolver, store.clone())
        .await
        .unwrap();
    (player, events, store, dir)
}

// Wait for a state-change event for `expected`, skipping volume events and
// unrelated transitions.
async fn wait_state(
    events: &mut mpsc::UnboundedReceiver<PlayerEvent>,
    expected: State,
) -> (Duration, Duration) {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for state change")
            .expect("event channel closed");
        if let PlayerEvent::StateChange {
            state,
            position,
            duration,
        } = event
        {
            if state == expected {
                return (position, duration);
            }
        }
    }
}

async fn wait_volume(events: &mut mpsc::UnboundedReceiver<PlayerEvent>) -> i32 {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for volume change")
            .expect("event channel closed");
        if let PlayerEvent::VolumeChange(volume) = event {
            return volume;
        }
    }
}

async fn snapshot(player: &Player) -> PlaylistSnapshot {
    let (tx, mut rx) = watch::channel(None);
    player.request_playlist(Arc::new(tx));
    timeout(WAIT, rx.changed()).await.unwrap().unwrap();
    let snapshot = rx.borrow_and_update().clone();
    snapshot.unwrap()
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_play_single_video() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["abc"]), 0, Duration::ZERO, "L1".into());

    // STOPPED -> BUFFERING while the stream resolves.
    wait_state(&mut events, State::Buffering).await;

    let calls = backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    let (url, position, volume) = calls
        .iter()
        .find_map(|c| match c {
            Call::Play {
                url,
                position,
                volume,
            } => Some((url.clone(), *position, *volume)),
            _ => None,
        })
        .unwrap();
    assert!(url.contains("abc"), "resolver was asked for abc: {}", url);
    assert_eq!(position, Duration::ZERO);
    assert_eq!(volume, -1);

    backend.emit(BackendEvent::Playing).await;
    let (position, _) = wait_state(&mut events, State::Playing).await;
    assert_eq!(position, Duration::ZERO);

    // With no volume ever requested, the backend's own volume is adopted
    // and announced on first playback.
    assert_eq!(wait_volume(&mut events).await, 80);

    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.playlist, ids(&["abc"]));
    assert_eq!(snapshot.index, 0);
    assert_eq!(snapshot.state, State::Playing);
    assert_eq!(snapshot.list_id, "L1");
}

#[tokio::test]
async fn test_seek_while_paused_restores_paused() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["abc"]), 0, Duration::ZERO, String::new());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    player.pause();
    backend
        .wait_for(|calls| calls.contains(&Call::Pause))
        .await;
    backend.emit(BackendEvent::Paused).await;
    wait_state(&mut events, State::Paused).await;

    *backend.position.lock().unwrap() = Duration::from_secs(30);
    player.seek(Duration::from_secs(90));

    // SEEKING is internal; the wire sees BUFFERING (code 3).
    let (position, _) = wait_state(&mut events, State::Seeking).await;
    assert_eq!(position, Duration::from_secs(90));
    assert_eq!(State::Seeking.wire_code(), 3);

    backend
        .wait_for(|calls| calls.contains(&Call::SetPosition(Duration::from_secs(90))))
        .await;

    // The backend resumes to apply the seek; the paused intent survives.
    backend.emit(BackendEvent::Playing).await;
    let (position, _) = wait_state(&mut events, State::Paused).await;
    assert_eq!(position, Duration::from_secs(90));

    let calls = backend
        .wait_for(|calls| calls.iter().filter(|c| **c == Call::Pause).count() >= 2)
        .await;
    let seek_at = calls
        .iter()
        .position(|c| *c == Call::SetPosition(Duration::from_secs(90)))
        .unwrap();
    let second_pause = calls
        .iter()
        .rposition(|c| *c == Call::Pause)
        .unwrap();
    assert!(second_pause > seek_at, "pause re-issued after the seek");
}

#[tokio::test]
async fn test_end_of_track_advances_playlist() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["a", "b", "c"]), 1, Duration::ZERO, String::new());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { url, .. } if url.contains("b"))))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    // End of file: the next video starts buffering.
    backend.emit(BackendEvent::Stopped).await;
    wait_state(&mut events, State::Buffering).await;

    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { url, .. } if url.contains("watch?v=c"))))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.index, 2);
}

#[tokio::test]
async fn test_end_of_playlist_settles_stopped_at_zero() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["only"]), 0, Duration::ZERO, String::new());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    backend.emit(BackendEvent::Stopped).await;
    let (position, _) = wait_state(&mut events, State::Stopped).await;
    assert_eq!(position, Duration::ZERO);

    // The playlist survives the natural stop.
    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.playlist, ids(&["only"]));
}

#[tokio::test]
async fn test_double_pause_yields_one_transition() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["abc"]), 0, Duration::ZERO, String::new());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    player.pause();
    player.pause();
    // The engine acknowledges once per property write.
    backend.emit(BackendEvent::Paused).await;
    backend.emit(BackendEvent::Paused).await;

    wait_state(&mut events, State::Paused).await;

    // Give any (incorrect) second transition time to surface.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut extra_transitions = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PlayerEvent::StateChange { .. }) {
            extra_transitions += 1;
        }
    }
    assert_eq!(extra_transitions, 0, "repeated PAUSED must be ignored");
}

#[tokio::test]
async fn test_spurious_backend_events_are_ignored() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    // PLAYING while stopped is post-stop noise.
    backend.emit(BackendEvent::Playing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    player.set_playstate(ids(&["abc"]), 0, Duration::ZERO, String::new());
    wait_state(&mut events, State::Buffering).await;

    // STOPPED while buffering is the previous track being replaced.
    backend.emit(BackendEvent::Stopped).await;

    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.index, 0, "no auto-advance from buffering noise");
    assert_eq!(snapshot.state, State::Playing);
}

#[tokio::test]
async fn test_volume_while_stopped_is_applied_at_load() {
    let backend = MockBackend::new();
    let (player, mut events, store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_volume(55);
    assert_eq!(wait_volume(&mut events).await, 55);
    // Not playing: nothing reaches the backend yet.
    assert!(!backend.calls().iter().any(|c| matches!(c, Call::SetVolume(_))));

    player.set_playstate(ids(&["abc"]), 0, Duration::ZERO, String::new());
    let calls = backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    // The dirty volume rides along with the load.
    assert!(calls
        .iter()
        .any(|c| matches!(c, Call::Play { volume: 55, .. })));

    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !backend.calls().iter().any(|c| matches!(c, Call::SetVolume(_))),
        "volume already applied at load must not be re-sent"
    );

    // And it is persisted for the next run.
    assert_eq!(store.get(VOLUME_KEY).as_deref(), Some("55"));
}

#[tokio::test]
async fn test_set_volume_is_idempotent() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["abc"]), 0, Duration::ZERO, String::new());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    player.set_volume(70);
    backend
        .wait_for(|calls| calls.contains(&Call::SetVolume(70)))
        .await;
    player.set_volume(70);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sets = backend
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::SetVolume(70)))
        .count();
    assert_eq!(sets, 1);
}

#[tokio::test]
async fn test_volume_is_clamped() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_volume(250);
    assert_eq!(wait_volume(&mut events).await, 100);
    player.change_volume(-300);
    assert_eq!(wait_volume(&mut events).await, 0);
}

#[tokio::test]
async fn test_playlist_update_keeps_current_track() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["a", "b", "c"]), 1, Duration::ZERO, "L1".into());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    player.update_playlist(ids(&["x", "b", "y", "z"]), "L2".into());

    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.playlist, ids(&["x", "b", "y", "z"]));
    assert_eq!(snapshot.index, 1, "current track re-indexed");
    assert_eq!(snapshot.state, State::Playing, "playback uninterrupted");
    assert_eq!(snapshot.list_id, "L2");
}

#[tokio::test]
async fn test_playlist_update_with_current_track_removed() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["a", "b", "c"]), 1, Duration::ZERO, String::new());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    // "b" is gone; its slot now holds another video, so the backend stops
    // and the remote gets to re-issue playback.
    player.update_playlist(ids(&["x", "y"]), String::new());
    wait_state(&mut events, State::Stopped).await;
    backend
        .wait_for(|calls| calls.contains(&Call::Stop))
        .await;

    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.index, 1, "prior index clamped into the new list");
    assert_eq!(snapshot.state, State::Stopped);
}

#[tokio::test]
async fn test_out_of_range_index_is_clamped() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["a", "b"]), 2, Duration::ZERO, String::new());
    wait_state(&mut events, State::Buffering).await;

    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { url, .. } if url.contains("watch?v=b"))))
        .await;

    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.index, 1);
}

#[tokio::test]
async fn test_set_video_jumps_within_playlist() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["a", "b", "c"]), 0, Duration::ZERO, String::new());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    player.set_video("c".into(), Duration::from_secs(7));
    wait_state(&mut events, State::Buffering).await;
    let calls = backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { url, .. } if url.contains("watch?v=c"))))
        .await;
    assert!(calls.iter().any(|c| matches!(
        c,
        Call::Play { position, .. } if *position == Duration::from_secs(7)
    )));

    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.index, 2);
}

#[tokio::test]
async fn test_stop_clears_playlist_but_keeps_index() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.set_playstate(ids(&["a", "b"]), 1, Duration::ZERO, String::new());
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    player.stop();
    wait_state(&mut events, State::Stopped).await;
    backend
        .wait_for(|calls| calls.contains(&Call::Stop))
        .await;

    let snapshot = snapshot(&player).await;
    assert!(snapshot.playlist.is_empty());
    // Kept for the follow-up updatePlaylist that removes the current video.
    assert_eq!(snapshot.index, 1);
}

#[tokio::test]
async fn test_stale_stream_is_discarded() {
    let backend = MockBackend::new();
    // Slow helper: the first resolution is still in flight when the track
    // changes under it.
    let resolver = shell_resolver("while read url; do sleep 0.2; echo \"$url\"; done");
    let (player, mut events, _store, _dir) = new_player(backend.clone(), resolver).await;

    player.set_playstate(ids(&["first"]), 0, Duration::ZERO, String::new());
    player.set_playstate(ids(&["second"]), 0, Duration::ZERO, String::new());

    wait_state(&mut events, State::Buffering).await;
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    // Both resolutions complete, but only the current track reaches the
    // backend.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let plays: Vec<_> = backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Play { url, .. } => Some(url),
            _ => None,
        })
        .collect();
    assert_eq!(plays.len(), 1);
    assert!(plays[0].contains("second"));
}

#[tokio::test]
async fn test_failed_resolution_advances_playlist() {
    let backend = MockBackend::new();
    // First request fails (blank line), later ones succeed.
    let resolver =
        shell_resolver("read url; echo; while read url; do echo \"$url\"; done");
    let (player, mut events, _store, _dir) = new_player(backend.clone(), resolver).await;

    player.set_playstate(ids(&["broken", "good"]), 0, Duration::ZERO, String::new());

    // The failed track behaves like end-of-file: advance to the next one.
    backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { url, .. } if url.contains("good"))))
        .await;
    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;

    let snapshot = snapshot(&player).await;
    assert_eq!(snapshot.index, 1);
}

#[tokio::test]
async fn test_snapshot_sink_keeps_only_latest() {
    let backend = MockBackend::new();
    let (player, _events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    let (tx, mut rx) = watch::channel(None);
    let sink = Arc::new(tx);

    // Two requests land before anyone reads; the sink holds one value.
    player.request_playlist(sink.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    player.request_playlist(sink.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    timeout(WAIT, rx.changed()).await.unwrap().unwrap();
    assert!(rx.borrow_and_update().is_some());
    // Nothing queued behind it.
    assert!(!rx.has_changed().unwrap());
}

#[tokio::test]
async fn test_persisted_volume_is_restored() {
    let backend = MockBackend::new();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("config.json")).unwrap());
    store.set(VOLUME_KEY, "33").unwrap();

    let (player, mut events, _) = {
        let (player, events) = Player::new(backend.clone(), echo_resolver(), store.clone())
            .await
            .unwrap();
        (player, events, ())
    };

    player.set_playstate(ids(&["abc"]), 0, Duration::ZERO, String::new());
    let calls = backend
        .wait_for(|calls| calls.iter().any(|c| matches!(c, Call::Play { .. })))
        .await;
    // The remembered volume is applied with the first load.
    assert!(calls
        .iter()
        .any(|c| matches!(c, Call::Play { volume: 33, .. })));

    backend.emit(BackendEvent::Playing).await;
    wait_state(&mut events, State::Playing).await;
}

#[tokio::test]
async fn test_quit_shuts_down_cleanly() {
    let backend = MockBackend::new();
    let (player, mut events, _store, _dir) = new_player(backend.clone(), echo_resolver()).await;

    player.quit();

    backend
        .wait_for(|calls| calls.contains(&Call::Quit))
        .await;

    // The event stream closes last, after backend shutdown.
    let closed = timeout(WAIT, async {
        loop {
            if events.recv().await.is_none() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "player events must close after quit");
}
