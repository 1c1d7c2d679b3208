// mpv backend, driven over the JSON IPC socket (--input-ipc-server).
// Commands are fire-and-forget JSON lines; property reads are matched to
// replies by request_id and may take unbounded time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::player::backend::{Backend, BackendEvent};
use crate::player::INITIAL_VOLUME;

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_PAUSE: Duration = Duration::from_millis(100);

pub struct MpvBackend {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_request: AtomicU64,
    // Handed out once by initialize().
    events: Mutex<Option<mpsc::Receiver<BackendEvent>>>,
    child: Mutex<Option<Child>>,
}

impl MpvBackend {
    /// Spawn mpv and connect to its IPC socket.
    pub async fn spawn() -> Result<Arc<MpvBackend>, AppError> {
        let socket_path = ipc_socket_path();
        let _ = std::fs::remove_file(&socket_path);

        let child = Command::new("mpv")
            .arg("--idle=yes")
            .arg("--no-video")
            .arg("--no-terminal")
            .arg("--no-resume-playback")
            // Assume a ~128kbps audio stream; the default cache is far too
            // large for that.
            .arg("--cache=yes")
            .arg("--cache-secs=10")
            .arg(format!("--volume={}", INITIAL_VOLUME))
            .arg(format!("--input-ipc-server={}", socket_path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stream = connect_with_retry(&socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        let (event_tx, event_rx) = mpsc::channel(16);
        let backend = Arc::new(MpvBackend {
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            events: Mutex::new(Some(event_rx)),
            child: Mutex::new(Some(child)),
        });

        tokio::spawn(run_reader(backend.clone(), read_half, event_tx));

        // Pause toggles arrive as property changes.
        backend
            .send(json!({"command": ["observe_property", 1, "pause"]}))
            .await;

        Ok(backend)
    }

    async fn send(&self, mut request: Value) {
        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        request["request_id"] = json!(id);

        let mut line = request.to_string();
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("mpv command failed: {}", e);
        }
    }

    async fn get_property(&self, name: &str) -> Result<Value, AppError> {
        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let request = json!({"command": ["get_property", name], "request_id": id});
        let mut line = request.to_string();
        line.push('\n');
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await.map_err(|_| {
                self.pending.lock().unwrap().remove(&id);
                AppError::PropertyUnavailable
            })?;
        }

        let reply = rx.await.map_err(|_| AppError::PropertyUnavailable)?;
        if reply.get("error").and_then(Value::as_str) == Some("success") {
            Ok(reply.get("data").cloned().unwrap_or(Value::Null))
        } else {
            Err(AppError::PropertyUnavailable)
        }
    }

    async fn get_seconds(&self, name: &str) -> Result<Duration, AppError> {
        let value = self.get_property(name).await?;
        let secs = value.as_f64().ok_or(AppError::PropertyUnavailable)?;
        if secs < 0.0 {
            return Err(AppError::PropertyUnavailable);
        }
        Ok(Duration::from_secs_f64(secs))
    }

    async fn set_property(&self, name: &str, value: Value) {
        self.send(json!({"command": ["set_property", name, value]}))
            .await;
    }
}

#[async_trait]
impl Backend for MpvBackend {
    async fn initialize(&self) -> Result<(mpsc::Receiver<BackendEvent>, i32), AppError> {
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AppError::Other("mpv backend already initialized".into()))?;

        let volume = match self.get_property("volume").await {
            Ok(v) => v.as_f64().map(|v| (v + 0.5) as i32).unwrap_or(INITIAL_VOLUME),
            Err(_) => INITIAL_VOLUME,
        };

        Ok((events, volume))
    }

    async fn play(&self, url: &str, position: Duration, volume: i32) {
        let mut options = String::new();
        if volume >= 0 {
            options.push_str(&format!("volume={}", volume));
        }

        if position.is_zero() {
            push_option(&mut options, "pause=no");
            self.send(json!({"command": ["loadfile", url, "replace", options]}))
                .await;
        } else {
            // Load paused, seek, then unpause, so playback starts at the
            // requested offset instead of audibly jumping.
            push_option(&mut options, "pause=yes");
            self.send(json!({"command": ["loadfile", url, "replace", options]}))
                .await;
            self.send(json!({
                "command": ["seek", format!("{:.3}", position.as_secs_f64()), "absolute"]
            }))
            .await;
            self.set_property("pause", json!(false)).await;
        }
    }

    async fn pause(&self) {
        self.set_property("pause", json!(true)).await;
    }

    async fn resume(&self) {
        self.set_property("pause", json!(false)).await;
    }

    async fn stop(&self) {
        self.send(json!({"command": ["stop"]})).await;
    }

    async fn set_position(&self, position: Duration) {
        self.send(json!({
            "command": ["seek", format!("{:.3}", position.as_secs_f64()), "absolute"]
        }))
        .await;
    }

    async fn get_position(&self) -> Result<Duration, AppError> {
        self.get_seconds("time-pos").await
    }

    async fn get_duration(&self) -> Result<Duration, AppError> {
        self.get_seconds("duration").await
    }

    async fn set_volume(&self, volume: i32) {
        self.set_property("volume", json!(volume)).await;
    }

    async fn quit(&self) {
        self.send(json!({"command": ["quit"]})).await;

        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            if let Err(e) = child.wait().await {
                warn!("could not reap mpv: {}", e);
            }
        }
    }
}

fn push_option(options: &mut String, option: &str) {
    if !options.is_empty() {
        options.push(',');
    }
    options.push_str(option);
}

fn ipc_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("loungecast-mpv-{}.sock", std::process::id()))
}

async fn connect_with_retry(path: &PathBuf) -> Result<UnixStream, AppError> {
    for _ in 0..CONNECT_ATTEMPTS {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(_) => tokio::time::sleep(CONNECT_PAUSE).await,
        }
    }
    Err(AppError::Other("could not connect to mpv IPC socket".into()))
}

// Reader task: dispatches replies to waiting property reads and translates
// mpv events into backend lifecycle events. Closing the socket (mpv quit)
// closes the event stream.
async fn run_reader(
    backend: Arc<MpvBackend>,
    read_half: OwnedReadHalf,
    events: mpsc::Sender<BackendEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let msg: Value = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("unreadable mpv message: {} ({})", line, e);
                continue;
            }
        };

        if let Some(id) = msg.get("request_id").and_then(Value::as_u64) {
            if let Some(tx) = backend.pending.lock().unwrap().remove(&id) {
                let _ = tx.send(msg);
            }
            continue;
        }

        let event = match msg.get("event").and_then(Value::as_str) {
            Some("playback-restart") => Some(BackendEvent::Playing),
            Some("end-file") => Some(BackendEvent::Stopped),
            Some("property-change")
                if msg.get("name").and_then(Value::as_str) == Some("pause") =>
            {
                match msg.get("data").and_then(Value::as_bool) {
                    Some(true) => Some(BackendEvent::Paused),
                    Some(false) => Some(BackendEvent::Playing),
                    None => None,
                }
            }
            _ => None,
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                break;
            }
        }
    }

    // EOF: mpv went away. Fail any outstanding property reads.
    backend.pending.lock().unwrap().clear();
}
