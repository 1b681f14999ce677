//! Line splitting over a streaming HTTP body.
//!
//! Both SSE (`data: ...` lines) and NDJSON bodies are line oriented, so the
//! streaming backends read them through this one reader.

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Response;

pub(crate) struct LineReader {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: BytesMut,
    finished: bool,
}

impl LineReader {
    pub fn new(response: Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buf: BytesMut::new(),
            finished: false,
        }
    }

    /// Next line without its terminator, or `None` at end of body.
    ///
    /// A trailing line without a newline is still returned.
    pub async fn next_line(&mut self) -> Option<reqwest::Result<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                return Some(Ok(decode_line(&line)));
            }

            if self.finished {
                if self.buf.is_empty() {
                    return None;
                }
                let rest = self.buf.split();
                return Some(Ok(decode_line(&rest)));
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(e)),
                None => self.finished = true,
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    line.trim_end_matches(['\n', '\r']).to_string()
}

/// Payload of an SSE `data:` line.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
        .map(str::trim)
}
