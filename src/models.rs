use serde::Deserialize;
use std::time::Duration;

use crate::error::{parse_error, AppError};

/// Seconds with three fractional digits, the wire encoding for every
/// duration and position.
pub fn format_seconds(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

/// Parse a decimal-seconds value ("90", "42.5") into a Duration. Negative
/// or unparseable input maps to zero.
pub fn parse_seconds(s: &str) -> Duration {
    match s.parse::<f64>() {
        Ok(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
        _ => Duration::ZERO,
    }
}

/// Split a `videoIds` argument into its ids. The remote joins them with
/// commas and no escaping; surrounding whitespace is not significant.
pub fn split_video_ids(s: &str) -> Vec<String> {
    s.split(',').map(|id| id.trim().to_string()).collect()
}

// Response types for the pairing API

#[derive(Debug, Deserialize)]
pub struct ScreenToken {
    #[serde(rename = "screenId")]
    pub screen_id: String,
    #[serde(rename = "loungeToken")]
    pub lounge_token: String,
    #[serde(default)]
    pub expiration: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ScreenTokenBatch {
    pub screens: Vec<ScreenToken>,
}

/// One decoded channel message: `[index, [command, args...]]`.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub index: i64,
    pub command: String,
    /// First argument object, when present. Almost every command carries a
    /// single map of string keys; `"c"`/`"S"` carry a bare string instead,
    /// surfaced through `string_arg`.
    pub args: serde_json::Value,
}

impl IncomingMessage {
    pub fn string_arg(&self) -> Option<&str> {
        self.args.as_str()
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// Parse one frame body: a JSON array of `[index, [command, args...]]` pairs.
pub fn parse_frame(body: &str) -> Result<Vec<IncomingMessage>, AppError> {
    let rows: Vec<serde_json::Value> =
        serde_json::from_str(body).map_err(|e| parse_error(e, "channel frame"))?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let pair = row
            .as_array()
            .ok_or_else(|| AppError::InvalidResponse("frame row is not an array".into()))?;
        if pair.len() < 2 {
            return Err(AppError::InvalidResponse("frame row too short".into()));
        }

        let index = pair[0]
            .as_i64()
            .ok_or_else(|| AppError::InvalidResponse("frame index is not a number".into()))?;

        let payload = pair[1]
            .as_array()
            .ok_or_else(|| AppError::InvalidResponse("frame payload is not an array".into()))?;
        let command = payload
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidResponse("frame command is not a string".into()))?
            .to_string();
        let args = payload.get(1).cloned().unwrap_or(serde_json::Value::Null);

        messages.push(IncomingMessage {
            index,
            command,
            args,
        });
    }

    Ok(messages)
}
