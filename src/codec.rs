// Codec for the Lounge channel's framing.
// The stream is a sequence of: <ASCII decimal length>\n<that many bytes of JSON>

use bytes::BytesMut;
use tokio_util::codec::Decoder;

pub struct FrameCodec {
    state: FrameCodecState,
}

enum FrameCodecState {
    // Waiting for a line containing the size
    ReadingSize,
    // Found size, now reading content
    ReadingContent { expected_size: usize },
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: FrameCodecState::ReadingSize,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &mut self.state {
                FrameCodecState::ReadingSize => {
                    // Look for a newline to delimit the size
                    if let Some(newline_pos) = buf.iter().position(|&b| b == b'\n') {
                        let line = buf.split_to(newline_pos + 1);

                        let size_str =
                            std::str::from_utf8(&line[..line.len() - 1]).map_err(|_| {
                                std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    "invalid UTF-8 in size header",
                                )
                            })?;
                        let size_str = size_str.trim();

                        // The server reports failures as an HTML error page
                        // rather than a frame; surface those as InvalidData.
                        if size_str.is_empty() || !size_str.chars().all(|c| c.is_ascii_digit()) {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                format!("expected numeric size, got: {}", size_str),
                            ));
                        }

                        let expected_size = size_str.parse::<usize>().map_err(|_| {
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                format!("invalid size: {}", size_str),
                            )
                        })?;

                        self.state = FrameCodecState::ReadingContent { expected_size };

                        // Continue loop to handle content immediately
                        continue;
                    }

                    // Not enough data for a full size line
                    return Ok(None);
                }

                FrameCodecState::ReadingContent { expected_size } => {
                    if buf.len() >= *expected_size {
                        let content = buf.split_to(*expected_size);

                        let message = String::from_utf8(content.to_vec()).map_err(|_| {
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "invalid UTF-8 in frame content",
                            )
                        })?;

                        self.state = FrameCodecState::ReadingSize;

                        return Ok(Some(message));
                    }

                    // Wait for more data
                    return Ok(None);
                }
            }
        }
    }
}

/// Decode every complete frame out of an already-buffered body, as returned
/// by the handshake POST (whose response is small and framed the same way).
pub fn decode_all(body: &[u8]) -> Result<Vec<String>, std::io::Error> {
    let mut buf = BytesMut::from(body);
    let mut codec = FrameCodec::new();
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buf)? {
        frames.push(frame);
    }
    Ok(frames)
}
