//! Application-level chunk framing
//!
//! Each batch written on a chunked long-poll response is the JSON text
//! followed by the frame separator `\r\n|\r\n`; any occurrence of the
//! separator inside the JSON is escaped by doubling the pipe. The HTTP layer
//! supplies the hex-length chunk envelope and the terminating zero chunk.
//! Receivers split on the separator and unescape each frame before parsing.

use bytes::Bytes;

/// Frame separator between JSON batches
pub const CHUNK_SEPARATOR: &str = "\r\n|\r\n";

/// Escaped form of the separator inside a frame body
pub const ESCAPED_SEPARATOR: &str = "\r\n||\r\n";

/// Escape separator occurrences inside a frame body
pub fn escape(payload: &str) -> String {
    payload.replace(CHUNK_SEPARATOR, ESCAPED_SEPARATOR)
}

/// Reverse of [`escape`]
pub fn unescape(payload: &str) -> String {
    payload.replace(ESCAPED_SEPARATOR, CHUNK_SEPARATOR)
}

/// Build one wire frame from a JSON batch
pub fn frame(json: &str) -> Bytes {
    let mut out = escape(json);
    out.push_str(CHUNK_SEPARATOR);
    Bytes::from(out)
}

/// Incremental frame splitter for the consuming side
///
/// Feed body fragments as they arrive; complete frames come back unescaped.
/// A separator straddling two fragments is handled by buffering.
#[derive(Default)]
pub struct FrameReader {
    buffer: String,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find(CHUNK_SEPARATOR) {
            let frame: String = self.buffer.drain(..idx + CHUNK_SEPARATOR.len()).collect();
            frames.push(unescape(&frame[..idx]));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        let payload = "a|\r\n|\r\n|b";
        let escaped = escape(payload);
        assert_eq!(escaped, "a|\r\n||\r\n|b");
        assert_eq!(unescape(&escaped), payload);
    }

    #[test]
    fn test_plain_payload_untouched() {
        assert_eq!(escape("[{\"data\":1}]"), "[{\"data\":1}]");
    }

    #[test]
    fn test_frame_appends_separator() {
        let bytes = frame("[]");
        assert_eq!(&bytes[..], b"[]\r\n|\r\n");
    }

    #[test]
    fn test_reader_single_frame() {
        let mut reader = FrameReader::new();
        let frames = reader.push("[1,2]\r\n|\r\n");
        assert_eq!(frames, vec!["[1,2]"]);
    }

    #[test]
    fn test_reader_multiple_frames_one_fragment() {
        let mut reader = FrameReader::new();
        let frames = reader.push("[1]\r\n|\r\n[2]\r\n|\r\n");
        assert_eq!(frames, vec!["[1]", "[2]"]);
    }

    #[test]
    fn test_reader_separator_straddles_fragments() {
        let mut reader = FrameReader::new();
        assert!(reader.push("[1]\r\n").is_empty());
        let frames = reader.push("|\r\n[2]\r\n|\r\n");
        assert_eq!(frames, vec!["[1]", "[2]"]);
    }

    #[test]
    fn test_reader_unescapes_embedded_separator() {
        let original = "payload with \r\n|\r\n inside";
        let mut reader = FrameReader::new();
        let wire = frame(original);
        let frames = reader.push(std::str::from_utf8(&wire).unwrap());
        assert_eq!(frames, vec![original]);
    }

    #[test]
    fn test_round_trip_arbitrary_sequence() {
        let payloads = [
            "plain",
            "with \r\n|\r\n separator",
            "double \r\n|\r\n and \r\n|\r\n again",
            "",
            "pipes ||| everywhere",
        ];

        let mut reader = FrameReader::new();
        let mut recovered = Vec::new();
        for payload in &payloads {
            let wire = frame(payload);
            recovered.extend(reader.push(std::str::from_utf8(&wire).unwrap()));
        }
        assert_eq!(recovered, payloads);
    }
}
