use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::TryStreamExt;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use reqwest::{Client, ClientBuilder};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

use crate::codec::{self, FrameCodec};
use crate::commands::{encode_batch, OutgoingMessage, RemoteCommand};
use crate::config::Store;
use crate::error::AppError;
use crate::models::{parse_frame, ScreenTokenBatch};
use crate::settings::SETTINGS;

const LOUNGE_BASE: &str = "https://www.youtube.com/api/lounge";

pub const SCREEN_ID_KEY: &str = "apps.youtube.screenId";

// Shared HTTP client for the short-lived pairing and send requests.
static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| {
    ClientBuilder::new()
        .timeout(SETTINGS.request_timeout)
        .build()
        .expect("could not build HTTP client")
});

// Separate client for the streaming GET, with a timeout comfortably above
// the service's NOOP heartbeat interval.
static LONG_POLL_CLIENT: Lazy<Client> = Lazy::new(|| {
    ClientBuilder::new()
        .timeout(SETTINGS.long_poll_timeout)
        .build()
        .expect("could not build HTTP client")
});

static SID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\["c","([^"]*)""#).unwrap());
static GSESSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\["S","([^"]*)""#).unwrap());

/// The `rid` counter for outbound requests: starts at a random 5-digit
/// number and increments by one per request. Re-randomized only when a new
/// initial handshake begins.
pub struct RandomId {
    number: Mutex<u32>,
}

impl Default for RandomId {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomId {
    pub fn new() -> RandomId {
        let rid = RandomId {
            number: Mutex::new(0),
        };
        rid.restart();
        rid
    }

    /// Reset the counter to a fresh random value, as if newly created.
    pub fn restart(&self) {
        *self.number.lock().unwrap() = rand::thread_rng().gen_range(10_000..90_000);
    }

    /// Return the next value, incrementing by one.
    pub fn next(&self) -> u32 {
        let mut number = self.number.lock().unwrap();
        *number += 1;
        *number
    }
}

/// Cache-buster token used by the service: 12 lowercase ASCII letters,
/// fresh per request, no semantics.
pub fn zx() -> String {
    let mut rng = rand::thread_rng();
    (0..12).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Outcome of offering an inbound message index to the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqDecision {
    /// The next expected message; apply it.
    Apply,
    /// Already seen; skip it.
    Old,
    /// Messages were missed; the service does not resend, so the index is
    /// accepted anyway.
    Gap,
}

/// Tracks `aid`, the last applied inbound index. Monotonically
/// non-decreasing; −1 until the first message of a session.
#[derive(Debug)]
pub struct Sequencer {
    aid: i64,
}

impl Sequencer {
    pub fn new() -> Sequencer {
        Sequencer { aid: -1 }
    }

    pub fn aid(&self) -> i64 {
        self.aid
    }

    pub fn reset(&mut self) {
        self.aid = -1;
    }

    pub fn accept(&mut self, index: i64) -> SeqDecision {
        if index <= self.aid {
            return SeqDecision::Old;
        }
        let gap = index > self.aid + 1;
        self.aid = index;
        if gap {
            SeqDecision::Gap
        } else {
            SeqDecision::Apply
        }
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

// Which kind of bind request the channel loop issues next. The reconnect
// table of the protocol maps directly onto transitions between these.
#[derive(Debug, Clone)]
enum BindMode {
    /// Initial handshake for a brand new session.
    Fresh,
    /// Initial handshake resuming an expired channel, carrying the old
    /// sid/aid as OSID/OAID.
    Resume { osid: String, oaid: i64 },
    /// Normal streaming GET on an established channel.
    Stream,
}

// Per-session handles. The inbound reader writes sid/gsessionid/aid; the
// sender reads them and advances ofs. The lock is never held across await.
struct Handles {
    screen_id: String,
    lounge_token: String,
    sid: String,
    gsessionid: String,
    seq: Sequencer,
    ofs: u64,
}

struct SessionInner {
    store: Arc<Store>,
    uuid: String,
    name: String,
    handles: Mutex<Handles>,
    rid: RandomId,
    running: AtomicBool,
}

/// A long-lived bidirectional channel with the Lounge service: ordered
/// inbound command delivery, micro-batched outbound sends, and recovery
/// from the transport errors the service uses.
pub struct LoungeSession {
    inner: Arc<SessionInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoungeSession {
    pub fn new(store: Arc<Store>, uuid: String, name: String) -> LoungeSession {
        LoungeSession {
            inner: Arc::new(SessionInner {
                store,
                uuid,
                name,
                handles: Mutex::new(Handles {
                    screen_id: String::new(),
                    lounge_token: String::new(),
                    sid: String::new(),
                    gsessionid: String::new(),
                    seq: Sequencer::new(),
                    ofs: 0,
                }),
                rid: RandomId::new(),
                running: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// The screen id, once acquired.
    pub fn screen_id(&self) -> Option<String> {
        let handles = self.inner.handles.lock().unwrap();
        if handles.screen_id.is_empty() {
            None
        } else {
            Some(handles.screen_id.clone())
        }
    }

    /// Open the channel and keep it alive. Decoded remote commands are
    /// delivered in order to `commands_tx`; messages on `outgoing_rx` are
    /// batched and posted back.
    pub fn start(
        &self,
        pairing_code: Option<String>,
        commands_tx: mpsc::Sender<RemoteCommand>,
        outgoing_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    ) {
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = channel_loop(&inner, pairing_code, &commands_tx, outgoing_rx).await {
                error!("lounge session failed: {}", e);
            }
            inner.running.store(false, Ordering::SeqCst);
            // Dropping commands_tx here closes the facade's inbound stream,
            // which in turn closes the outgoing queue and the sender.
        });
        *self.task.lock().unwrap() = Some(task);
    }

    pub fn running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Tear the channel down. The abort closes the inbound command stream,
    /// which cascades through the facade into the sender.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

// Main channel loop: handshake, then stream, reconnecting per the error
// classification until told to stop or the retry budget runs out.
async fn channel_loop(
    inner: &Arc<SessionInner>,
    pairing_code: Option<String>,
    commands_tx: &mpsc::Sender<RemoteCommand>,
    outgoing_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
) -> Result<(), AppError> {
    // The screen id is durable; fetch it only on first run.
    let screen_id = match inner.store.get(SCREEN_ID_KEY) {
        Some(id) => id,
        None => {
            info!("requesting screen id");
            let mut retries: u32 = 0;
            loop {
                match fetch_screen_id().await {
                    Ok(id) => {
                        inner.store.set(SCREEN_ID_KEY, &id)?;
                        break id;
                    }
                    Err(e) if e.is_retriable() => {
                        retries += 1;
                        if retries >= SETTINGS.max_retries {
                            return Err(e);
                        }
                        warn!("could not get screen id ({}), backing off", e);
                        tokio::time::sleep(backoff_delay(retries)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    };
    inner.handles.lock().unwrap().screen_id = screen_id.clone();

    let mut mode = BindMode::Fresh;
    let mut retries: u32 = 0;
    let mut token_needed = true;
    let mut pairing_code = pairing_code;
    let mut outgoing_rx = Some(outgoing_rx);

    loop {
        if !inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let result = match &mode {
            BindMode::Fresh | BindMode::Resume { .. } => {
                let token_result = if token_needed {
                    info!("requesting lounge token");
                    match fetch_lounge_token(&screen_id).await {
                        Ok(token) => {
                            inner.handles.lock().unwrap().lounge_token = token;
                            token_needed = false;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    Ok(())
                };
                match token_result {
                    Ok(()) => open_channel(inner, &mode, commands_tx).await,
                    Err(e) => Err(e),
                }
            }
            BindMode::Stream => stream_channel(inner, commands_tx).await,
        };

        match result {
            Ok(()) => {
                if !matches!(mode, BindMode::Stream) {
                    // Channel established. Pairing registration is
                    // side-information and must not affect channel state.
                    if let Some(code) = pairing_code.take() {
                        if let Err(e) = register_pairing_code(&screen_id, &code).await {
                            warn!("could not register pairing code: {}", e);
                        }
                    }
                    if let Some(rx) = outgoing_rx.take() {
                        let sender_inner = inner.clone();
                        tokio::spawn(run_sender(sender_inner, rx));
                    }
                    mode = BindMode::Stream;
                }
                // A cleanly closed stream is the service's normal long-poll
                // rotation; reconnect immediately.
                retries = 0;
            }
            Err(AppError::SessionExpired) => {
                let (osid, oaid) = {
                    let mut handles = inner.handles.lock().unwrap();
                    let osid = handles.sid.clone();
                    let oaid = handles.seq.aid();
                    handles.seq.reset();
                    (osid, oaid)
                };
                warn!("channel expired, resuming session {}", osid);
                mode = BindMode::Resume { osid, oaid };
                retries += 1;
            }
            Err(AppError::SessionGone) => {
                warn!("channel gone, performing a full handshake");
                {
                    let mut handles = inner.handles.lock().unwrap();
                    handles.sid.clear();
                    handles.gsessionid.clear();
                    handles.seq.reset();
                }
                token_needed = true;
                mode = BindMode::Fresh;
                retries += 1;
            }
            Err(AppError::Timeout) => {
                // Does not count against the retry budget.
                info!("bind timed out, retrying in {:?}", SETTINGS.timeout_pause);
                tokio::time::sleep(SETTINGS.timeout_pause).await;
                continue;
            }
            Err(AppError::Transient(reason)) => {
                warn!("bind failed ({}), backing off", reason);
                retries += 1;
            }
            Err(e) => return Err(e),
        }

        if retries > 0 {
            // The failed attempt that reaches the cap is the last one.
            if retries >= SETTINGS.max_retries {
                return Err(AppError::Other(format!(
                    "giving up after {} reconnect attempts",
                    retries
                )));
            }
            tokio::time::sleep(backoff_delay(retries)).await;
        }
    }
}

/// Quadratic reconnect backoff: `retries² × unit`.
pub fn backoff_delay(retries: u32) -> std::time::Duration {
    SETTINGS.backoff_unit * retries.saturating_mul(retries)
}

// Initial bind POST. The response is a small framed batch that must carry
// "c" (sid) and "S" (gsessionid).
async fn open_channel(
    inner: &Arc<SessionInner>,
    mode: &BindMode,
    commands_tx: &mpsc::Sender<RemoteCommand>,
) -> Result<(), AppError> {
    // Only a brand new session restarts the request-id sequence; a resume
    // after SID expiry keeps counting where the old channel left off.
    if matches!(mode, BindMode::Fresh) {
        inner.rid.restart();
    }

    let url = {
        let handles = inner.handles.lock().unwrap();
        let mut url = bind_open_url(
            &inner.uuid,
            &inner.name,
            &handles.lounge_token,
            inner.rid.next(),
            &zx(),
        );
        if let BindMode::Resume { osid, oaid } = mode {
            url.push_str(&format!(
                "&OSID={}&OAID={}",
                urlencoding::encode(osid),
                oaid
            ));
        }
        url
    };

    {
        let mut handles = inner.handles.lock().unwrap();
        handles.sid.clear();
        handles.gsessionid.clear();
        handles.seq.reset();
        handles.ofs = 0;
    }

    debug!("opening channel");
    let response = SHARED_CLIENT
        .post(&url)
        .form(&[("count", "0")])
        .send()
        .await
        .map_err(transportify)?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    let body = response.bytes().await.map_err(transportify)?;
    let frames = codec::decode_all(&body)
        .map_err(|e| AppError::InvalidResponse(format!("bad handshake framing: {}", e)))?;
    for frame in &frames {
        process_frame(inner, commands_tx, frame).await?;
    }

    let ids_missing = {
        let handles = inner.handles.lock().unwrap();
        handles.sid.is_empty() || handles.gsessionid.is_empty()
    };
    if ids_missing {
        // Fall back to scraping the raw body.
        match extract_session_ids(&body) {
            Some((sid, gsessionid)) => {
                let mut handles = inner.handles.lock().unwrap();
                handles.sid = sid;
                handles.gsessionid = gsessionid;
            }
            None => {
                return Err(AppError::InvalidResponse(
                    "failed to obtain session IDs".to_string(),
                ))
            }
        }
    }

    info!("channel established");
    Ok(())
}

// Streaming GET: frames arrive until the service rotates the connection.
async fn stream_channel(
    inner: &Arc<SessionInner>,
    commands_tx: &mpsc::Sender<RemoteCommand>,
) -> Result<(), AppError> {
    let url = {
        let handles = inner.handles.lock().unwrap();
        bind_stream_url(
            &inner.uuid,
            &inner.name,
            &handles.lounge_token,
            &handles.sid,
            handles.seq.aid(),
            &handles.gsessionid,
            &zx(),
        )
    };

    debug!("connecting to message channel");
    let response = LONG_POLL_CLIENT
        .get(&url)
        .send()
        .await
        .map_err(transportify)?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    let stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut framed = FramedRead::new(StreamReader::new(stream), FrameCodec::new());

    use futures::StreamExt;
    while let Some(frame) = framed.next().await {
        if !inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        match frame {
            Ok(body) => process_frame(inner, commands_tx, &body).await?,
            // Malformed framing is handled like a dropped connection.
            Err(e) => return Err(AppError::Transient(format!("stream error: {}", e))),
        }
    }

    debug!("message channel closed");
    Ok(())
}

// Apply one frame: sequencing first, then internal commands, then decode
// and forward everything else.
async fn process_frame(
    inner: &Arc<SessionInner>,
    commands_tx: &mpsc::Sender<RemoteCommand>,
    body: &str,
) -> Result<(), AppError> {
    let messages = parse_frame(body)?;

    for msg in messages {
        let decision = inner.handles.lock().unwrap().seq.accept(msg.index);
        match decision {
            SeqDecision::Old => {
                info!("old command: {} {}", msg.index, msg.command);
                continue;
            }
            SeqDecision::Gap => {
                warn!("missed messages before index {}", msg.index);
            }
            SeqDecision::Apply => {}
        }

        match msg.command.as_str() {
            "noop" => {}
            "c" => {
                if let Some(sid) = msg.string_arg() {
                    inner.handles.lock().unwrap().sid = sid.to_string();
                }
            }
            "S" => {
                if let Some(gsessionid) = msg.string_arg() {
                    inner.handles.lock().unwrap().gsessionid = gsessionid.to_string();
                }
            }
            "loungeStatus" => {
                debug!("lounge status: {:?}", msg.arg("devices"));
            }
            _ => match RemoteCommand::decode(&msg) {
                Ok(Some(command)) => {
                    debug!("command: {} {}", msg.index, msg.command);
                    if commands_tx.send(command).await.is_err() {
                        return Err(AppError::Other("command receiver went away".into()));
                    }
                }
                Ok(None) => {
                    info!("unknown command: {} {:?}", msg.command, msg.args);
                }
                Err(reason) => {
                    warn!("ignoring malformed command: {}", reason);
                }
            },
        }
    }

    Ok(())
}

// Outbound sender: drains the queue into micro-batches and posts them.
// A single task preserves enqueue order end to end.
async fn run_sender(inner: Arc<SessionInner>, mut rx: mpsc::UnboundedReceiver<OutgoingMessage>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + SETTINGS.batch_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                msg = rx.recv() => match msg {
                    Some(msg) => batch.push(msg),
                    None => break,
                },
            }
        }

        if let Err(e) = post_batch_with_retry(&inner, &batch).await {
            error!("giving up on outbound batch: {}", e);
            inner.running.store(false, Ordering::SeqCst);
            break;
        }
    }
    debug!("outgoing queue closed, sender exiting");
}

async fn post_batch_with_retry(
    inner: &Arc<SessionInner>,
    batch: &[OutgoingMessage],
) -> Result<(), AppError> {
    let mut retries: u32 = 0;
    loop {
        match post_batch(inner, batch).await {
            Ok(()) => return Ok(()),
            Err(AppError::SessionExpired) | Err(AppError::SessionGone) => {
                // The inbound reader owns session recovery; this batch is
                // lost with the channel.
                warn!("dropping {} outbound messages with expired channel", batch.len());
                return Ok(());
            }
            Err(e) if e.is_retriable() => {
                retries += 1;
                if retries >= SETTINGS.max_retries {
                    return Err(e);
                }
                warn!("outbound post failed ({}), backing off", e);
                tokio::time::sleep(backoff_delay(retries)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn post_batch(inner: &Arc<SessionInner>, batch: &[OutgoingMessage]) -> Result<(), AppError> {
    let (url, body) = {
        let handles = inner.handles.lock().unwrap();
        if handles.sid.is_empty() {
            return Err(AppError::SessionExpired);
        }
        let url = bind_send_url(
            &inner.uuid,
            &inner.name,
            &handles.lounge_token,
            &handles.sid,
            inner.rid.next(),
            handles.seq.aid(),
            &handles.gsessionid,
            &zx(),
        );
        (url, encode_batch(batch, handles.ofs))
    };

    for msg in batch {
        debug!("send msg: {} {:?}", msg.command, msg.args);
    }

    let response = SHARED_CLIENT
        .post(&url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(transportify)?;

    let status = response.status().as_u16();
    if status != 200 {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &text));
    }

    inner.handles.lock().unwrap().ofs += batch.len() as u64;
    Ok(())
}

/// Map a non-200 bind status onto the session error taxonomy.
pub fn classify_status(status: u16, body: &str) -> AppError {
    match status {
        400 if body.contains("Unknown SID") => AppError::SessionExpired,
        410 => AppError::SessionGone,
        502 => AppError::Transient("502 from lounge service".to_string()),
        _ => AppError::InvalidResponse(format!("unexpected HTTP status {}", status)),
    }
}

// Connection-level failures are retriable; timeouts get their own pause.
fn transportify(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        AppError::Transient(err.to_string())
    } else {
        AppError::RequestError(err)
    }
}

fn bind_base(uuid: &str, name: &str, lounge_token: &str) -> String {
    format!(
        "{}/bc/bind?device=LOUNGE_SCREEN&id={}&name={}&loungeIdToken={}&VER=8",
        LOUNGE_BASE,
        urlencoding::encode(uuid),
        urlencoding::encode(name),
        urlencoding::encode(lounge_token),
    )
}

/// URL of the handshake POST (`count=0` body).
pub fn bind_open_url(uuid: &str, name: &str, lounge_token: &str, rid: u32, zx: &str) -> String {
    format!("{}&RID={}&zx={}", bind_base(uuid, name, lounge_token), rid, zx)
}

/// URL of the streaming inbound GET.
pub fn bind_stream_url(
    uuid: &str,
    name: &str,
    lounge_token: &str,
    sid: &str,
    aid: i64,
    gsessionid: &str,
    zx: &str,
) -> String {
    format!(
        "{}&RID=rpc&SID={}&CI=0&AID={}&gsessionid={}&TYPE=xmlhttp&zx={}",
        bind_base(uuid, name, lounge_token),
        urlencoding::encode(sid),
        aid,
        urlencoding::encode(gsessionid),
        zx
    )
}

/// URL of the outbound batch POST.
#[allow(clippy::too_many_arguments)]
pub fn bind_send_url(
    uuid: &str,
    name: &str,
    lounge_token: &str,
    sid: &str,
    rid: u32,
    aid: i64,
    gsessionid: &str,
    zx: &str,
) -> String {
    format!(
        "{}&SID={}&RID={}&AID={}&gsessionid={}&zx={}",
        bind_base(uuid, name, lounge_token),
        urlencoding::encode(sid),
        rid,
        aid,
        urlencoding::encode(gsessionid),
        zx
    )
}

/// Scrape sid/gsessionid out of a raw handshake body; fallback for when the
/// framed parse did not surface them.
pub fn extract_session_ids(body: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(body);
    let sid = SID_RE
        .captures(&text)
        .and_then(|cap| cap.get(1).map(|m| m.as_str().to_string()))?;
    let gsessionid = GSESSION_RE
        .captures(&text)
        .and_then(|cap| cap.get(1).map(|m| m.as_str().to_string()))?;
    Some((sid, gsessionid))
}

async fn fetch_screen_id() -> Result<String, AppError> {
    let response = SHARED_CLIENT
        .get(format!("{}/pairing/generate_screen_id", LOUNGE_BASE))
        .send()
        .await
        .map_err(transportify)?;
    if !response.status().is_success() {
        return Err(AppError::InvalidResponse(format!(
            "failed to generate screen id: {}",
            response.status()
        )));
    }
    Ok(response.text().await?.trim().to_string())
}

async fn fetch_lounge_token(screen_id: &str) -> Result<String, AppError> {
    let response = SHARED_CLIENT
        .post(format!("{}/pairing/get_lounge_token_batch", LOUNGE_BASE))
        .form(&[("screen_ids", screen_id)])
        .send()
        .await
        .map_err(transportify)?;
    if !response.status().is_success() {
        return Err(AppError::InvalidResponse(format!(
            "failed to get lounge token: {}",
            response.status()
        )));
    }

    let batch = response.json::<ScreenTokenBatch>().await?;
    batch
        .screens
        .into_iter()
        .next()
        .map(|screen| screen.lounge_token)
        .ok_or_else(|| AppError::InvalidResponse("no screens returned".to_string()))
}

async fn register_pairing_code(screen_id: &str, pairing_code: &str) -> Result<(), AppError> {
    let response = SHARED_CLIENT
        .post(format!("{}/pairing/register_pairing_code", LOUNGE_BASE))
        .form(&[
            ("access_type", "permanent"),
            ("pairing_code", pairing_code),
            ("screen_id", screen_id),
        ])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(AppError::InvalidResponse(format!(
            "failed to register pairing code: {}",
            response.status()
        )));
    }
    Ok(())
}
