use once_cell::sync::Lazy;
use std::{env, time::Duration};

/// Holds all tunables, read-once from ENV with fallbacks.
pub struct Settings {
    /// Name announced over SSDP/DIAL and to the Lounge service.
    pub friendly_name: String,
    /// Port for the DIAL/UPnP HTTP server (0 picks a free port).
    pub http_port: u16,
    /// Disable the SSDP responder (useful behind another advertiser).
    pub disable_ssdp: bool,
    /// Deadline for collecting outbound lounge messages into one batch.
    pub batch_delay: Duration,
    /// Base unit of the quadratic reconnect backoff.
    pub backoff_unit: Duration,
    /// Give up reconnecting after this many consecutive failures.
    pub max_retries: u32,
    /// Pause after a long-poll timeout before binding again.
    pub timeout_pause: Duration,
    pub request_timeout: Duration,
    pub long_poll_timeout: Duration,
    /// Program used to resolve watch URLs to stream URLs, with its
    /// arguments. The default drives the embedded yt_dlp helper script.
    pub helper_command: Vec<String>,
}

impl Settings {
    fn from_env() -> Self {
        // optionally load .env
        let _ = dotenv::dotenv();

        fn parse_u16(var: &str, default: u16) -> u16 {
            env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        fn parse_u32(var: &str, default: u32) -> u32 {
            env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        fn parse_bool(var: &str) -> bool {
            matches!(env::var(var).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
        }

        fn parse_secs(var: &str, default_secs: u64) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(default_secs))
        }

        fn parse_millis(var: &str, default_ms: u64) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_millis(default_ms))
        }

        Settings {
            friendly_name: env::var("FRIENDLY_NAME").unwrap_or_else(|_| "Loungecast".to_string()),
            http_port: parse_u16("HTTP_PORT", 8008),
            disable_ssdp: parse_bool("NO_SSDP"),
            batch_delay: parse_millis("BATCH_DELAY_MS", 10),
            backoff_unit: parse_millis("BACKOFF_UNIT_MS", 500),
            max_retries: parse_u32("MAX_RETRIES", 25),
            timeout_pause: parse_secs("TIMEOUT_PAUSE_SECS", 30),
            request_timeout: parse_secs("REQUEST_TIMEOUT_SECS", 300),
            long_poll_timeout: parse_secs("LONG_POLL_TIMEOUT_SECS", 32 * 60),
            helper_command: env::var("STREAM_HELPER")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

/// Global settings instance
pub static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);
