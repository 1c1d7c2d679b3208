// Shared test fixtures: a scriptable in-process backend and a resolver
// whose helper is a shell one-liner.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use loungecast::error::AppError;
use loungecast::player::{Backend, BackendEvent};
use loungecast::resolver::StreamResolver;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Play {
        url: String,
        position: Duration,
        volume: i32,
    },
    Pause,
    Resume,
    Stop,
    SetPosition(Duration),
    SetVolume(i32),
    Quit,
}

pub struct MockBackend {
    calls: Mutex<Vec<Call>>,
    events_rx: Mutex<Option<mpsc::Receiver<BackendEvent>>>,
    events_tx: Mutex<Option<mpsc::Sender<BackendEvent>>>,
    pub position: Mutex<Duration>,
    pub duration: Mutex<Duration>,
    initial_volume: i32,
}

impl MockBackend {
    pub fn new() -> Arc<MockBackend> {
        MockBackend::with_volume(80)
    }

    pub fn with_volume(initial_volume: i32) -> Arc<MockBackend> {
        let (tx, rx) = mpsc::channel(32);
        Arc::new(MockBackend {
            calls: Mutex::new(Vec::new()),
            events_rx: Mutex::new(Some(rx)),
            events_tx: Mutex::new(Some(tx)),
            position: Mutex::new(Duration::ZERO),
            duration: Mutex::new(Duration::ZERO),
            initial_volume,
        })
    }

    /// Emit a backend lifecycle event, as the real engine would.
    pub async fn emit(&self, event: BackendEvent) {
        let tx = self
            .events_tx
            .lock()
            .unwrap()
            .clone()
            .expect("backend already quit");
        tx.send(event).await.expect("controller went away");
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    /// Wait until the recorded calls satisfy a predicate.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Vec<Call>
    where
        F: FnMut(&[Call]) -> bool,
    {
        for _ in 0..200 {
            let calls = self.calls();
            if predicate(&calls) {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backend calls never matched: {:?}", self.calls());
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn initialize(&self) -> Result<(mpsc::Receiver<BackendEvent>, i32), AppError> {
        let rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AppError::Other("mock already initialized".into()))?;
        Ok((rx, self.initial_volume))
    }

    async fn play(&self, url: &str, position: Duration, volume: i32) {
        self.record(Call::Play {
            url: url.to_string(),
            position,
            volume,
        });
    }

    async fn pause(&self) {
        self.record(Call::Pause);
    }

    async fn resume(&self) {
        self.record(Call::Resume);
    }

    async fn stop(&self) {
        self.record(Call::Stop);
    }

    async fn set_position(&self, position: Duration) {
        self.record(Call::SetPosition(position));
    }

    async fn get_position(&self) -> Result<Duration, AppError> {
        Ok(*self.position.lock().unwrap())
    }

    async fn get_duration(&self) -> Result<Duration, AppError> {
        Ok(*self.duration.lock().unwrap())
    }

    async fn set_volume(&self, volume: i32) {
        self.record(Call::SetVolume(volume));
    }

    async fn quit(&self) {
        self.record(Call::Quit);
        // Closing the sender closes the event stream, as the contract
        // requires after quit.
        self.events_tx.lock().unwrap().take();
    }
}

/// A resolver whose helper echoes the watch URL back as the stream URL.
pub fn echo_resolver() -> Arc<StreamResolver> {
    shell_resolver("while read url; do echo \"$url\"; done")
}

/// A resolver with an arbitrary shell script as its helper.
pub fn shell_resolver(script: &str) -> Arc<StreamResolver> {
    StreamResolver::with_helper("sh", &["-c".to_string(), script.to_string()])
        .expect("could not spawn helper")
}
