//! Inline ICY metadata removal.
//!
//! Shoutcast-style servers interleave a metadata block every `icy-metaint` body bytes:
//! one length byte (`len * 16` bytes follow), then the block, NUL padded.

/// Splits a body byte stream into audio bytes and metadata blocks.
#[derive(Clone, Debug, Default)]
pub struct IcyFilter {
    interval: usize,
    until_meta: usize,
    meta_left: Option<usize>,
    meta: Vec<u8>,
}

impl IcyFilter {
    /// Filter for a stream announcing `icy-metaint: interval`. Zero disables filtering.
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            until_meta: interval,
            meta_left: None,
            meta: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.interval > 0
    }

    /// Append audio bytes of `input` to `body` and completed metadata blocks to `metadata`.
    pub fn feed(&mut self, mut input: &[u8], body: &mut Vec<u8>, metadata: &mut Vec<String>) {
        if !self.is_active() {
            body.extend_from_slice(input);
            return;
        }

        while !input.is_empty() {
            match self.meta_left {
                None if self.until_meta > 0 => {
                    let n = self.until_meta.min(input.len());
                    body.extend_from_slice(&input[..n]);
                    self.until_meta -= n;
                    input = &input[n..];
                }
                None => {
                    let len = input[0] as usize * 16;
                    input = &input[1..];
                    if len == 0 {
                        self.until_meta = self.interval;
                    } else {
                        self.meta.clear();
                        self.meta_left = Some(len);
                    }
                }
                Some(left) => {
                    let n = left.min(input.len());
                    self.meta.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    if n == left {
                        self.meta_left = None;
                        self.until_meta = self.interval;
                        let text = String::from_utf8_lossy(&self.meta);
                        let text = text.trim_end_matches('\0').trim();
                        if !text.is_empty() {
                            metadata.push(text.to_string());
                        }
                    } else {
                        self.meta_left = Some(left - n);
                    }
                }
            }
        }
    }
}

/// Extract `StreamTitle='...'` from an ICY metadata block.
pub fn stream_title(block: &str) -> Option<&str> {
    let start = block.find("StreamTitle='")? + "StreamTitle='".len();
    let rest = &block[start..];
    let end = rest.find("';").unwrap_or_else(|| rest.trim_end_matches('\'').len());
    Some(&rest[..end])
}
