/// Reassembles newline-terminated lines from byte chunks of arbitrary size.
///
/// Bytes of a UTF-8 sequence split across two chunks are held back until the
/// sequence is complete; invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: String,
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every line it completed, in order. The
    /// unterminated remainder stays buffered.
    pub fn decode_line(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode_text(chunk);

        let mut lines: Vec<String> = self.buffer.split('\n').map(str::to_string).collect();
        if lines.len() == 1 {
            return Vec::new();
        }
        self.buffer = lines.pop().unwrap_or_default();
        lines
    }

    /// Returns whatever is buffered as a final line, for streams that end
    /// without a trailing newline.
    pub fn flush(&mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            self.buffer.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        if self.buffer.is_empty() {
            return Vec::new();
        }
        vec![std::mem::take(&mut self.buffer)]
    }

    fn decode_text(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending[..valid_up_to]) {
                        self.buffer.push_str(valid);
                    }
                    match e.error_len() {
                        // Invalid bytes: replace and keep going.
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                        // Incomplete sequence at the end: wait for the next chunk.
                        None => {
                            self.pending.drain(..valid_up_to);
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(chunks: &[&[u8]]) -> (Vec<Vec<String>>, Vec<String>) {
        let mut decoder = LineDecoder::new();
        let per_chunk = chunks.iter().map(|c| decoder.decode_line(c)).collect();
        (per_chunk, decoder.flush())
    }

    #[test]
    fn unterminated_line_waits_for_flush() {
        let (lines, rest) = feed(&[b"line1".as_slice()]);
        assert_eq!(lines, vec![Vec::<String>::new()]);
        assert_eq!(rest, vec!["line1"]);
    }

    #[test]
    fn terminated_line_is_returned_immediately() {
        let (lines, rest) = feed(&[b"line1\n".as_slice()]);
        assert_eq!(lines, vec![vec!["line1".to_string()]]);
        assert!(rest.is_empty());
    }

    #[test]
    fn several_lines_in_one_chunk() {
        let (lines, rest) = feed(&[b"line1\nline2\nline3".as_slice()]);
        assert_eq!(lines, vec![vec!["line1".to_string(), "line2".to_string()]]);
        assert_eq!(rest, vec!["line3"]);
    }

    #[test]
    fn line_split_over_chunks() {
        let (lines, rest) = feed(&[b"part1".as_slice(), b"part2".as_slice(), b"part3\n".as_slice()]);
        assert!(lines[0].is_empty());
        assert!(lines[1].is_empty());
        assert_eq!(lines[2], vec!["part1part2part3"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn empty_lines_are_preserved() {
        let (lines, _) = feed(&[b"a\n\nb\n".as_slice()]);
        assert_eq!(lines[0], vec!["a", "", "b"]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let text = "héllo → wörld\n";
        let bytes = text.as_bytes();
        // 'é' is two bytes, '→' three; cut inside both.
        let arrow = text.find('→').unwrap();
        let (lines, rest) = feed(&[&bytes[..2], &bytes[2..arrow + 1], &bytes[arrow + 1..]]);
        let all: Vec<String> = lines.into_iter().flatten().collect();
        assert_eq!(all, vec!["héllo → wörld"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn every_split_point_reconstructs_the_text() {
        let text = "{\"event\":\"content\"}\nzwei\u{00fc}ber\n\u{1F600} done";
        let bytes = text.as_bytes();
        for cut in 0..=bytes.len() {
            let mut decoder = LineDecoder::new();
            let mut lines = decoder.decode_line(&bytes[..cut]);
            lines.extend(decoder.decode_line(&bytes[cut..]));
            lines.extend(decoder.flush());
            assert_eq!(lines.join("\n"), text, "cut at byte {cut}");
        }
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let (lines, _) = feed(&[b"ok\xff\n".as_slice()]);
        assert_eq!(lines[0], vec!["ok\u{FFFD}"]);
    }

    #[test]
    fn dangling_partial_sequence_is_flushed_lossily() {
        let (_, rest) = feed(&[b"abc\xe2\x86".as_slice()]);
        assert_eq!(rest, vec!["abc\u{FFFD}"]);
    }
}
