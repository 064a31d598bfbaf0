//! Incremental parser for an instance's server-sent event feed.
//!
//! Records are separated by a blank line. Lines starting with `:` are
//! comments, lines starting with `data:` carry payload, and multiple payload
//! lines of one record are joined with `\n`.

/// Buffers raw bytes and yields complete record payloads.
#[derive(Debug, Default)]
pub struct FeedParser {
    buffer: Vec<u8>,
}

impl FeedParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return the payload of every record it completed.
    ///
    /// Records without `data:` lines are skipped. Incomplete trailing data
    /// stays buffered until the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some((end, separator_len)) = next_separator(&self.buffer) {
            let record: Vec<u8> = self.buffer.drain(..end + separator_len).take(end).collect();
            if let Some(payload) = record_payload(&record) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Bytes received but not yet part of a complete record.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn next_separator(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|pos| (pos, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn record_payload(record: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(record);
    let data: Vec<&str> = text
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.starts_with(':'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}
