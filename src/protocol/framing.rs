//! Object framing for the controller's JSON stream.
//!
//! The controller terminates each object with a newline, but it does not
//! guarantee that a read returns whole lines: one read may end mid-object,
//! and another may carry several objects at once. [`JsonFramer`] therefore
//! ignores line boundaries and extracts one top-level `{...}` object at a
//! time by tracking brace depth, skipping braces that appear inside string
//! literals (including escaped quotes).
//!
//! # Example
//!
//! ```
//! use hdscanner::protocol::JsonFramer;
//!
//! let mut framer = JsonFramer::new();
//! framer.push(br#"{"method":"Sta"#);
//! assert_eq!(framer.next_frame().unwrap(), None);
//!
//! framer.push(br#"geInfo","X":1.0}"#);
//! let frame = framer.next_frame().unwrap().unwrap();
//! assert_eq!(frame, br#"{"method":"StageInfo","X":1.0}"#);
//! ```
//!
//! Scanning is byte-oriented. That is safe for UTF-8 input because every
//! byte of a multi-byte sequence is >= 0x80 and can never be mistaken for
//! `{`, `}`, `"` or `\`.

use thiserror::Error;

/// Largest object the framer will buffer (16MB) before giving up on it.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// An object grew past the size limit without closing. The partial
    /// object has been discarded.
    #[error("unterminated object of {buffered} bytes exceeds maximum {max} bytes")]
    Oversized { buffered: usize, max: usize },
}

/// Incremental scan position inside the object at the front of the buffer.
#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    /// Bytes of the buffer already scanned; zero means no object started.
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl ScanState {
    /// Feed one byte; returns true when it closes the top-level object.
    fn advance(&mut self, byte: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return false;
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' => self.depth += 1,
            b'}' => {
                self.depth = self.depth.saturating_sub(1);
                return self.depth == 0;
            }
            _ => {}
        }
        false
    }
}

/// Accumulates inbound bytes and yields complete top-level JSON objects.
///
/// After [`next_frame`](Self::next_frame) returns `Ok(None)`, the buffer
/// holds only the (possibly empty) start of the next object.
#[derive(Debug)]
pub struct JsonFramer {
    buf: Vec<u8>,
    scan: ScanState,
    max_frame: usize,
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonFramer {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            scan: ScanState::default(),
            max_frame,
        }
    }

    /// Append bytes received from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scan = ScanState::default();
    }

    /// Extract the next complete object, if the buffer holds one.
    ///
    /// Bytes between objects (newlines, stray text) are dropped. Scanning
    /// resumes where the previous call stopped, so an object split over many
    /// reads is only scanned once.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::Oversized`] when an unterminated object exceeds
    /// the size limit. The buffer is reset so the stream can resynchronize on
    /// the next `{`.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.scan.pos == 0 {
            match self.buf.iter().position(|&b| b == b'{') {
                Some(start) => {
                    self.buf.drain(..start);
                }
                None => {
                    self.buf.clear();
                    return Ok(None);
                }
            }
        }

        while self.scan.pos < self.buf.len() {
            let byte = self.buf[self.scan.pos];
            self.scan.pos += 1;
            if self.scan.advance(byte) {
                let frame = self.buf.drain(..self.scan.pos).collect();
                self.scan = ScanState::default();
                return Ok(Some(frame));
            }
        }

        if self.buf.len() > self.max_frame {
            let buffered = self.buf.len();
            self.clear();
            return Err(FramingError::Oversized {
                buffered,
                max: self.max_frame,
            });
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(framer: &mut JsonFramer) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = framer.next_frame().expect("framing error") {
            frames.push(String::from_utf8(frame).expect("utf-8"));
        }
        frames
    }

    #[test]
    fn test_single_object_with_newline() {
        let mut framer = JsonFramer::new();
        framer.push(b"{\"method\":\"DeviceInfo\"}\n");

        assert_eq!(drain(&mut framer), vec![r#"{"method":"DeviceInfo"}"#]);
        // The trailing newline is inter-message noise and is dropped on the next scan.
        assert_eq!(framer.next_frame(), Ok(None));
        assert!(framer.is_empty());
    }

    #[test]
    fn test_object_split_across_reads() {
        let mut framer = JsonFramer::new();
        framer.push(br#"{"method":"Sta"#);
        assert_eq!(framer.next_frame(), Ok(None));
        assert_eq!(framer.buffered(), br#"{"method":"Sta"#);

        framer.push(br#"geInfo","X":1.0,"Y":2.0,"Z":3.0}"#);
        assert_eq!(
            drain(&mut framer),
            vec![r#"{"method":"StageInfo","X":1.0,"Y":2.0,"Z":3.0}"#]
        );
    }

    #[test]
    fn test_byte_at_a_time() {
        let input = br#"{"method":"FocusStopped","result":0}"#;
        let mut framer = JsonFramer::new();
        let mut frames = Vec::new();
        for byte in input.iter() {
            framer.push(std::slice::from_ref(byte));
            if let Some(frame) = framer.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![input.to_vec()]);
    }

    #[test]
    fn test_multiple_objects_in_one_read_preserve_remainder() {
        let mut framer = JsonFramer::new();
        framer.push(b"{\"method\":\"A\"}\n{\"method\":\"B\"}\n{\"method\":\"C");

        assert_eq!(
            drain(&mut framer),
            vec![r#"{"method":"A"}"#, r#"{"method":"B"}"#]
        );
        assert_eq!(framer.buffered(), br#"{"method":"C"#);

        framer.push(b"\"}\n");
        assert_eq!(drain(&mut framer), vec![r#"{"method":"C"}"#]);
    }

    #[test]
    fn test_nested_objects_are_one_frame() {
        let mut framer = JsonFramer::new();
        framer.push(br#"{"method":"StageInfo","pos":{"X":1,"Y":{"deep":[{}]}}}{"method":"Next"}"#);

        assert_eq!(
            drain(&mut framer),
            vec![
                r#"{"method":"StageInfo","pos":{"X":1,"Y":{"deep":[{}]}}}"#,
                r#"{"method":"Next"}"#,
            ]
        );
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let mut framer = JsonFramer::new();
        framer.push(br#"{"method":"ErrorInfo","result":"bad token } in {input","code":3}"#);

        assert_eq!(
            drain(&mut framer),
            vec![r#"{"method":"ErrorInfo","result":"bad token } in {input","code":3}"#]
        );
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let mut framer = JsonFramer::new();
        framer.push(br#"{"result":"say \"}\" twice \\","method":"X"}"#);

        assert_eq!(
            drain(&mut framer),
            vec![r#"{"result":"say \"}\" twice \\","method":"X"}"#]
        );
    }

    #[test]
    fn test_escape_split_across_reads() {
        let mut framer = JsonFramer::new();
        framer.push(br#"{"result":"a\"#);
        assert_eq!(framer.next_frame(), Ok(None));
        framer.push(br#""}","method":"X"}"#);

        assert_eq!(drain(&mut framer), vec![r#"{"result":"a\"}","method":"X"}"#]);
    }

    #[test]
    fn test_leading_noise_is_discarded() {
        let mut framer = JsonFramer::new();
        framer.push(b"\r\n garbage ] }");
        assert_eq!(framer.next_frame(), Ok(None));
        assert!(framer.is_empty());

        framer.push(b"xx{\"method\":\"Stop\"}");
        assert_eq!(drain(&mut framer), vec![r#"{"method":"Stop"}"#]);
    }

    #[test]
    fn test_multibyte_utf8_payload() {
        let mut framer = JsonFramer::new();
        let text = "{\"method\":\"ErrorInfo\",\"result\":\"Objektiv blockiert – µm\"}";
        let bytes = text.as_bytes();
        framer.push(&bytes[..30]);
        assert_eq!(framer.next_frame(), Ok(None));
        framer.push(&bytes[30..]);

        assert_eq!(drain(&mut framer), vec![text]);
    }

    #[test]
    fn test_oversized_object_is_discarded() {
        let mut framer = JsonFramer::with_max_frame(16);
        framer.push(br#"{"method":"CameraImage","result":"#);

        assert_eq!(
            framer.next_frame(),
            Err(FramingError::Oversized {
                buffered: 33,
                max: 16
            })
        );
        assert!(framer.is_empty());

        // The stream resynchronizes on the next object.
        framer.push(br#""x"}{"method":"Stop"}"#);
        assert_eq!(drain(&mut framer), vec![r#"{"method":"Stop"}"#]);
    }
}
