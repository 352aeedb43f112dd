use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::ExecutorError;

/// Incremental decoder for `text/event-stream` bodies.
///
/// Chunks may split lines anywhere; only complete `data:` lines are
/// emitted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the data payloads it completed.
    /// Bytes are decoded only once their line is complete, so a multibyte
    /// character split across chunks survives.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(data) = data_payload(&line) {
                events.push(data);
            }
        }
        events
    }

    /// Payload of a trailing line that never got its newline
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    line.trim_end_matches(['\n', '\r'])
        .strip_prefix("data:")
        .map(|data| data.trim_start().to_string())
}

/// Incremental text fragments from a streaming completion.
///
/// Ends when the provider signals completion or the connection closes;
/// a transport failure is yielded as the last item.
pub struct TextStream {
    rx: mpsc::Receiver<Result<String, ExecutorError>>,
}

impl TextStream {
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<Result<String, ExecutorError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    pub async fn next_fragment(&mut self) -> Option<Result<String, ExecutorError>> {
        self.rx.recv().await
    }

    /// Drain the stream into one string
    pub async fn collect_text(mut self) -> Result<String, ExecutorError> {
        let mut text = String::new();
        while let Some(fragment) = self.rx.recv().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Stream for TextStream {
    type Item = Result<String, ExecutorError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
