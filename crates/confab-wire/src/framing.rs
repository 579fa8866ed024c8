//! Framing of the streamed response body.
//!
//! The service delivers its response as a chunked body. Chunk boundaries are
//! chosen by the transport and carry no meaning, so the decoder buffers
//! partial data until a complete frame is available. Two historical framing
//! variants exist; the protocol generation fixes which one a connection uses.

use crate::error::Result;

/// How the response body is split into frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// One frame per newline-terminated line. Blank lines between frames
    /// are skipped.
    Newline,
    /// A frame is the text strictly between a begin marker and the next end
    /// marker. Bytes are consumed only up through the end marker.
    Marker { begin: String, end: String },
}

impl Framing {
    /// Marker-delimited framing with the given literals.
    pub fn marker(begin: impl Into<String>, end: impl Into<String>) -> Self {
        Framing::Marker {
            begin: begin.into(),
            end: end.into(),
        }
    }
}

/// Incremental frame decoder.
///
/// Bytes are buffered raw so that UTF-8 sequences and marker literals split
/// across delivery chunks behave exactly as if the body had arrived in one
/// piece. Completed frames are converted to text; invalid UTF-8 in a
/// completed frame is fatal to the whole stream.
#[derive(Debug)]
pub struct FrameBuffer {
    framing: Framing,
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: Vec::new(),
        }
    }

    /// Append a delivery chunk and return the frames it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        match &self.framing {
            Framing::Newline => {
                while let Some(idx) = self.pending.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = self.pending.drain(..=idx).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if line.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    frames.push(to_text(&line)?);
                }
            }
            Framing::Marker { begin, end } => {
                while let Some(end_at) = find(&self.pending, end.as_bytes()) {
                    let span: Vec<u8> = self.pending.drain(..end_at + end.len()).collect();
                    match find(&span[..end_at], begin.as_bytes()) {
                        Some(begin_at) => {
                            frames.push(to_text(&span[begin_at + begin.len()..end_at])?);
                        }
                        None => {
                            // End marker with no begin marker before it: the
                            // span is dropped and no frame is produced. See
                            // the resynchronization note in DESIGN.md.
                            tracing::debug!(
                                discarded = end_at,
                                "end marker without begin marker, resynchronizing"
                            );
                        }
                    }
                }
            }
        }

        Ok(frames)
    }

    /// Flush the buffer at end of stream.
    ///
    /// Newline framing treats an unterminated trailing line as a final
    /// frame. Marker framing discards an incomplete trailing span.
    pub fn finish(&mut self) -> Result<Option<String>> {
        let mut rest = std::mem::take(&mut self.pending);
        match &self.framing {
            Framing::Newline => {
                if rest.last() == Some(&b'\r') {
                    rest.pop();
                }
                if rest.iter().all(|b| b.is_ascii_whitespace()) {
                    Ok(None)
                } else {
                    Ok(Some(to_text(&rest)?))
                }
            }
            Framing::Marker { .. } => Ok(None),
        }
    }
}

fn to_text(bytes: &[u8]) -> Result<String> {
    Ok(std::str::from_utf8(bytes)?.to_owned())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_all(framing: Framing, chunks: &[&[u8]]) -> Vec<String> {
        let mut buffer = FrameBuffer::new(framing);
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(buffer.push(chunk).unwrap());
        }
        if let Some(last) = buffer.finish().unwrap() {
            frames.push(last);
        }
        frames
    }

    // --- Newline framing ---

    #[test]
    fn test_newline_single_chunk() {
        let frames = collect_all(Framing::Newline, &[b"{\"a\":1}\n{\"b\":2}\n"]);
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_newline_blank_lines_skipped() {
        let frames = collect_all(Framing::Newline, &[b"{\"a\":1}\n\n\r\n  \n{\"b\":2}\n"]);
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_newline_crlf() {
        let frames = collect_all(Framing::Newline, &[b"{\"a\":1}\r\n{\"b\":2}\r\n"]);
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_newline_trailing_line_flushed() {
        let frames = collect_all(Framing::Newline, &[b"{\"a\":1}\n{\"b\":2}"]);
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_newline_every_split_point() {
        let body: &[u8] = b"{\"a\":1}\n\n{\"second\":\"fr\\name\"}\n{\"c\":3}\n";
        let whole = collect_all(Framing::Newline, &[body]);
        for split in 0..=body.len() {
            let frames = collect_all(Framing::Newline, &[&body[..split], &body[split..]]);
            assert_eq!(frames, whole, "split at byte {}", split);
        }
    }

    #[test]
    fn test_newline_byte_at_a_time() {
        let body: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let chunks: Vec<&[u8]> = body.chunks(1).collect();
        assert_eq!(
            collect_all(Framing::Newline, &chunks),
            collect_all(Framing::Newline, &[body])
        );
    }

    #[test]
    fn test_newline_multibyte_utf8_split_across_chunks() {
        let body = "{\"text\":\"héllo\"}\n".as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let at = body.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let frames = collect_all(Framing::Newline, &[&body[..at], &body[at..]]);
        assert_eq!(frames, vec!["{\"text\":\"héllo\"}"]);
    }

    #[test]
    fn test_newline_invalid_utf8_is_fatal() {
        let mut buffer = FrameBuffer::new(Framing::Newline);
        let result = buffer.push(b"\xff\xfe\n");
        assert!(result.is_err());
    }

    // --- Marker framing ---

    fn markers() -> Framing {
        Framing::marker("<<", ">>")
    }

    #[test]
    fn test_marker_single_chunk() {
        let frames = collect_all(markers(), &[b"<<{\"a\":1}>><<{\"b\":2}>>"]);
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_marker_noise_between_frames() {
        let frames = collect_all(markers(), &[b"<<{\"a\":1}>>\n \n<<{\"b\":2}>>"]);
        // The separator bytes sit before the second frame's begin marker and
        // are dropped with that span.
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_marker_every_split_point() {
        let body: &[u8] = b"junk>><<{\"a\":1}>> <<{\"b\":2}>>";
        let whole = collect_all(markers(), &[body]);
        for split in 0..=body.len() {
            let frames = collect_all(markers(), &[&body[..split], &body[split..]]);
            assert_eq!(frames, whole, "split at byte {}", split);
        }
    }

    #[test]
    fn test_marker_end_without_begin_resynchronizes() {
        // Bytes before a located end marker are discarded even though no
        // begin marker was seen. No frame comes out of the first span.
        let frames = collect_all(markers(), &[b"corrupt tail>><<{\"a\":1}>>"]);
        assert_eq!(frames, vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_marker_incomplete_trailing_span_discarded() {
        let frames = collect_all(markers(), &[b"<<{\"a\":1}>><<{\"b\""]);
        assert_eq!(frames, vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_marker_split_inside_marker_literal() {
        let body: &[u8] = b"<<{\"a\":1}>>";
        // Split between the two '>' bytes of the end marker.
        let at = body.len() - 1;
        let frames = collect_all(markers(), &[&body[..at], &body[at..]]);
        assert_eq!(frames, vec!["{\"a\":1}"]);
    }
}
