use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::settings::SETTINGS;

// Streams normally expire in 6 hours; keep a margin of one hour.
const EXPIRY_ESTIMATE: Duration = Duration::from_secs(5 * 3600);
const EXPIRY_MARGIN: Duration = Duration::from_secs(3600);

// Audio-first format preference. MKV-container audio seeks reliably where
// DASH aac in MP4 does not, so it comes first.
const HELPER_FORMATS: &str = "171/172/43/22/18";

// Line-oriented resolver helper: one watch URL in on stdin, one stream URL
// out on stdout. The helper keeps yt_dlp loaded across requests, which is
// why requests to it are serialized through a single worker.
const HELPER_SCRIPT: &str = r#"
try:
    import sys
    from yt_dlp import YoutubeDL

    if len(sys.argv) != 2:
        sys.stderr.write('provide one argument with the format string\n')
        sys.exit(1)

    ydl = YoutubeDL({
        'format': sys.argv[1],
        'quiet': True,
        'simulate': True})

    sys.stderr.write('stream helper started\n')

    while True:
        stream = ''
        try:
            url = input()
            stream = ydl.extract_info(url, ie_key='Youtube')['url']
        except (KeyboardInterrupt, EOFError, IOError):
            break
        except Exception:
            sys.stderr.write('could not extract stream, try updating yt_dlp\n')
        finally:
            try:
                sys.stdout.write(stream + '\n')
                sys.stdout.flush()
            except Exception:
                pass

except (KeyboardInterrupt, EOFError, IOError):
    pass
"#;

#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    Pending,
    Ready(String),
    Failed,
}

/// One cached stream URL. Readiness is published through a watch latch so
/// waiters never touch the resolver map after lookup.
struct StreamEntry {
    video_id: String,
    expires: Mutex<SystemTime>,
    tx: watch::Sender<Fetch>,
    rx: watch::Receiver<Fetch>,
}

impl StreamEntry {
    fn new(video_id: &str) -> Arc<StreamEntry> {
        let (tx, rx) = watch::channel(Fetch::Pending);
        Arc::new(StreamEntry {
            video_id: video_id.to_string(),
            expires: Mutex::new(SystemTime::now() + EXPIRY_ESTIMATE),
            tx,
            rx,
        })
    }

    /// True if this entry expires within the safety margin.
    fn near_expiry(&self) -> bool {
        *self.expires.lock().unwrap() < SystemTime::now() + EXPIRY_MARGIN
    }
}

enum Job {
    Fetch(Arc<StreamEntry>),
    Quit,
}

/// Maps video ids to currently valid audio stream URLs. Entries are created
/// on demand, coalesce concurrent requests, and are replaced once their
/// expiry approaches. All resolution goes through one serial worker owning
/// the helper subprocess.
pub struct StreamResolver {
    entries: Mutex<HashMap<String, Arc<StreamEntry>>>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl StreamResolver {
    /// Spawn the resolver with the configured helper command (falling back
    /// to the embedded yt_dlp script).
    pub fn spawn() -> Result<Arc<StreamResolver>, AppError> {
        let configured = &SETTINGS.helper_command;
        if configured.is_empty() {
            StreamResolver::with_helper(
                "python3",
                &["-c".to_string(), HELPER_SCRIPT.to_string(), HELPER_FORMATS.to_string()],
            )
        } else {
            StreamResolver::with_helper(&configured[0], &configured[1..])
        }
    }

    /// Spawn with an explicit helper program; tests substitute shell
    /// one-liners here.
    pub fn with_helper(program: &str, args: &[String]) -> Result<Arc<StreamResolver>, AppError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Other("helper has no stdin".into()))?;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(jobs_rx, child, stdin));

        Ok(Arc::new(StreamResolver {
            entries: Mutex::new(HashMap::new()),
            jobs: jobs_tx,
        }))
    }

    /// Resolve a video id to a stream URL, waiting for the fetch to finish.
    /// Returns an empty string on failure; a later call for the same id
    /// restarts resolution.
    pub async fn resolve(&self, video_id: &str) -> String {
        let entry = self.entry_for(video_id);
        let mut rx = entry.rx.clone();

        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                Fetch::Ready(url) => return url,
                Fetch::Failed => return String::new(),
                Fetch::Pending => {}
            }
            if rx.changed().await.is_err() {
                return String::new();
            }
        }
    }

    /// Start resolving a video id without waiting for the result.
    pub fn prefetch(&self, video_id: &str) {
        self.entry_for(video_id);
    }

    /// Release the helper subprocess. No further calls are permitted after
    /// this returns; in-flight entries are failed.
    pub fn shutdown(&self) {
        let _ = self.jobs.send(Job::Quit);
    }

    // Look up a usable entry or create a replacement and queue its fetch.
    // Pending entries are always reused so concurrent requests coalesce.
    fn entry_for(&self, video_id: &str) -> Arc<StreamEntry> {
        assert!(!video_id.is_empty(), "empty video ID");

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(video_id) {
            let reusable = match &*entry.rx.borrow() {
                Fetch::Pending => true,
                Fetch::Ready(_) => {
                    if entry.near_expiry() {
                        info!("stream expires soon for {}, refetching", video_id);
                        false
                    } else {
                        true
                    }
                }
                Fetch::Failed => false,
            };
            if reusable {
                return entry.clone();
            }
        }

        let entry = StreamEntry::new(video_id);
        entries.insert(video_id.to_string(), entry.clone());
        if self.jobs.send(Job::Fetch(entry.clone())).is_err() {
            // Worker already shut down; fail the entry so waiters return.
            let _ = entry.tx.send(Fetch::Failed);
        }
        entry
    }
}

// Serial worker: strict FIFO over the helper pipe. The helper is stateful
// and not thread-safe, so there is exactly one of these.
async fn run_worker(mut jobs: mpsc::UnboundedReceiver<Job>, mut child: Child, stdin: ChildStdin) {
    let stdout = match child.stdout.take() {
        Some(out) => out,
        None => return,
    };
    let mut lines = BufReader::new(stdout).lines();
    let mut stdin = stdin;

    while let Some(job) = jobs.recv().await {
        let entry = match job {
            Job::Fetch(entry) => entry,
            Job::Quit => break,
        };

        let watch_url = format!("https://www.youtube.com/watch?v={}\n", entry.video_id);
        debug!("fetching stream for {}", entry.video_id.as_str());

        let line = match stdin.write_all(watch_url.as_bytes()).await {
            Ok(()) => lines.next_line().await.unwrap_or(None),
            Err(e) => {
                warn!("could not write to stream helper: {}", e);
                None
            }
        };

        match line {
            Some(line) if !line.trim().is_empty() => {
                let url = line.trim().to_string();
                if let Some(expires) = parse_expiry(&url) {
                    *entry.expires.lock().unwrap() = expires;
                } else {
                    debug!("no expire parameter in stream URL for {}", entry.video_id);
                }
                debug!("got stream for {}", entry.video_id.as_str());
                let _ = entry.tx.send(Fetch::Ready(url));
            }
            _ => {
                warn!("stream helper returned no URL for {}", entry.video_id);
                let _ = entry.tx.send(Fetch::Failed);
            }
        }
    }

    // Closing stdin lets the helper exit on EOF; reap it afterwards.
    drop(stdin);
    let _ = child.wait().await;
}

/// Extract the expiry from a stream URL's `expire` query parameter
/// (seconds since the epoch).
pub fn parse_expiry(stream_url: &str) -> Option<SystemTime> {
    let url = reqwest::Url::parse(stream_url).ok()?;
    let (_, expire) = url.query_pairs().find(|(k, _)| k == "expire")?;
    let secs: u64 = expire.parse().ok()?;
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}
