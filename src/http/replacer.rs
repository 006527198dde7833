//! Streaming `{{key}}` substitution for response bodies.

use memchr::{memchr, memmem};
use std::collections::HashMap;

/// Replaces `{{key}}` placeholders in a byte stream fed chunk by chunk.
///
/// Unknown keys are left as written. A placeholder may be split over any
/// number of chunks; at most `longest key + 4` bytes are held back.
pub(crate) struct Replacer<'m> {
    map: &'m HashMap<String, String>,
    pending: Vec<u8>,
    window: usize,
}

impl<'m> Replacer<'m> {
    pub(crate) fn new(map: &'m HashMap<String, String>) -> Self {
        let longest = map.keys().map(String::len).max().unwrap_or(0);

        Self {
            map,
            pending: Vec::new(),
            window: longest + 4,
        }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(chunk);

        let pending = &self.pending;
        let mut i = 0;

        while i < pending.len() {
            let Some(open) = memchr(b'{', &pending[i..]) else {
                out.extend_from_slice(&pending[i..]);
                i = pending.len();
                break;
            };
            out.extend_from_slice(&pending[i..i + open]);
            i += open;

            if pending.len() - i < 2 {
                break;
            }
            if pending[i + 1] != b'{' {
                out.push(b'{');
                i += 1;
                continue;
            }

            let end = pending.len().min(i + self.window);
            match memmem::find(&pending[i + 2..end], b"}}") {
                Some(k) => {
                    let value = std::str::from_utf8(&pending[i + 2..i + 2 + k])
                        .ok()
                        .and_then(|key| self.map.get(key));

                    match value {
                        Some(value) => {
                            out.extend_from_slice(value.as_bytes());
                            i += k + 4;
                        }
                        None => {
                            out.push(b'{');
                            i += 1;
                        }
                    }
                }
                // The placeholder may still close in the next chunk
                None if i + self.window > pending.len() => break,
                None => {
                    out.push(b'{');
                    i += 1;
                }
            }
        }

        self.pending.drain(..i);
    }

    /// Flushes the bytes held back at the end of the stream.
    pub(crate) fn finish(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.pending);
    }
}

pub(crate) fn replace_all(map: &HashMap<String, String>, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut replacer = Replacer::new(map);

    replacer.feed(data, &mut out);
    replacer.finish(&mut out);
    out
}
