#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed, in order.
    ///
    /// Lines are returned without their `\n` (or `\r\n`) terminator. Invalid
    /// UTF-8 is replaced rather than rejected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(newline) = rest.iter().position(|byte| *byte == b'\n') {
            self.pending.extend_from_slice(&rest[..newline]);
            lines.push(decode_line(&self.pending));
            self.pending.clear();
            rest = &rest[newline + 1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut splitter = LineSplitter::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(splitter.push(chunk));
        }
        lines.extend(splitter.finish());
        lines
    }

    #[test]
    fn buffers_partial_lines_across_reads() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"CodeNomad Server is re").is_empty());
        assert_eq!(splitter.pending, b"CodeNomad Server is re");
        assert_eq!(
            splitter.push(b"ady at http://127.0.0.1:54321\nnext"),
            vec!["CodeNomad Server is ready at http://127.0.0.1:54321".to_string()]
        );
        assert_eq!(splitter.finish(), Some("next".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn strips_carriage_returns_and_keeps_empty_lines() {
        assert_eq!(
            split_all(&[b"one\r\n\r\ntwo\n"]),
            vec!["one".to_string(), String::new(), "two".to_string()]
        );
    }

    #[test]
    fn output_does_not_depend_on_chunk_boundaries() {
        let input: &[u8] =
            b"boot\r\n{\"level\":\"info\",\"msg\":\"http server listening\",\"port\":4100}\n\nready \xe2\x9c\x93\ntail";
        let expected = split_all(&[input]);
        assert_eq!(expected.len(), 5);

        for first in 0..=input.len() {
            for second in first..=input.len() {
                let lines = split_all(&[&input[..first], &input[first..second], &input[second..]]);
                assert_eq!(lines, expected, "split at {first}/{second}");
            }
        }

        let bytewise: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(split_all(&bytewise), expected);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        assert_eq!(split_all(&[b"bad \xff byte\n"]), vec!["bad \u{fffd} byte".to_string()]);
    }
}
