use std::fmt::Display;
use std::pin::{pin, Pin};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::models::{OllamaChatChunk, OllamaPullLine};
use crate::models::PullProgress;
use crate::providers::types::{ProviderError, StreamEvent};

/// Incremental newline-delimited JSON decoder.
///
/// Bytes are buffered by `push`; `next_item` decodes one complete line at a
/// time and the remainder is carried forward. Splitting happens on raw bytes
/// so multi-byte characters cut across reads are never mis-decoded.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: BytesMut,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete line, skipping blank ones.
    ///
    /// A malformed line is consumed and reported; lines before it have
    /// already been handed out.
    pub fn next_item<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProviderError> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            if let Some(item) = decode_line(&line[..pos])? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Decode whatever is left once the underlying stream has ended.
    pub fn finish<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProviderError> {
        let rest = self.buffer.split();
        decode_line(&rest)
    }
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<Option<T>, ProviderError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(line)
        .map(Some)
        .map_err(|e| ProviderError::InvalidResponse(format!("Malformed stream line: {}", e)))
}

async fn next_bytes<S, E>(
    stream: &mut Pin<&mut S>,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>, ProviderError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Aborted),
        next = stream.next() => match next {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(ProviderError::NetworkError(format!("Stream error: {}", e))),
            None => Ok(None),
        },
    }
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), ProviderError> {
    tx.send(event).await.map_err(|_| {
        tracing::debug!("Chat event receiver dropped, stopping stream");
        ProviderError::Aborted
    })
}

/// Forward one daemon chunk. Returns `true` once the final chunk was seen.
async fn forward_chunk(
    chunk: OllamaChatChunk,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<bool, ProviderError> {
    if let Some(error) = chunk.error {
        return Err(ProviderError::Daemon(error));
    }

    if let Some(delta) = chunk.message {
        if let Some(thinking) = delta.thinking.filter(|t| !t.is_empty()) {
            emit(tx, StreamEvent::Thinking(thinking)).await?;
        }
        if !delta.content.is_empty() {
            emit(tx, StreamEvent::Token(delta.content)).await?;
        }
    }

    if chunk.done {
        emit(
            tx,
            StreamEvent::Done {
                prompt_tokens: chunk.prompt_eval_count,
                completion_tokens: chunk.eval_count,
            },
        )
        .await?;
        return Ok(true);
    }

    Ok(false)
}

pub async fn parse_chat_stream<S, E>(
    stream: S,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> Result<(), ProviderError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut stream = pin!(stream);
    let mut decoder = NdjsonDecoder::new();

    while let Some(bytes) = next_bytes(&mut stream, &cancel).await? {
        decoder.push(&bytes);
        while let Some(chunk) = decoder.next_item::<OllamaChatChunk>()? {
            if forward_chunk(chunk, &tx).await? {
                return Ok(());
            }
        }
    }

    if let Some(chunk) = decoder.finish::<OllamaChatChunk>()? {
        if forward_chunk(chunk, &tx).await? {
            return Ok(());
        }
    }

    // No done marker before EOF: what arrived is the whole answer
    emit(
        &tx,
        StreamEvent::Done {
            prompt_tokens: None,
            completion_tokens: None,
        },
    )
    .await
}

fn into_progress(line: OllamaPullLine) -> Result<PullProgress, ProviderError> {
    if let Some(error) = line.error {
        return Err(ProviderError::Daemon(error));
    }
    Ok(PullProgress {
        status: line.status,
        digest: line.digest,
        total: line.total,
        completed: line.completed,
    })
}

pub async fn parse_pull_stream<S, E>(
    stream: S,
    on_progress: &mut (dyn FnMut(PullProgress) + Send),
    cancel: CancellationToken,
) -> Result<(), ProviderError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut stream = pin!(stream);
    let mut decoder = NdjsonDecoder::new();

    while let Some(bytes) = next_bytes(&mut stream, &cancel).await? {
        decoder.push(&bytes);
        while let Some(line) = decoder.next_item::<OllamaPullLine>()? {
            on_progress(into_progress(line)?);
        }
    }

    if let Some(line) = decoder.finish::<OllamaPullLine>()? {
        on_progress(into_progress(line)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes()))),
        )
    }

    fn drain(decoder: &mut NdjsonDecoder) -> Vec<PullProgress> {
        let mut items = Vec::new();
        while let Some(item) = decoder.next_item().unwrap() {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_decoder_yields_complete_lines_in_order() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"{\"status\":\"a\"}\n{\"status\":\"b\",\"total\":10,\"completed\":5}\n");
        let items = drain(&mut decoder);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status, "a");
        assert_eq!(items[1].status, "b");
        assert_eq!(items[1].total, Some(10));
        assert_eq!(items[1].completed, Some(5));
        assert!(decoder.finish::<PullProgress>().unwrap().is_none());
    }

    #[test]
    fn test_decoder_carries_partial_line_forward() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"{\"stat");
        assert!(drain(&mut decoder).is_empty());

        decoder.push(b"us\":\"x\"}\n{\"status\":");
        let second = drain(&mut decoder);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].status, "x");

        decoder.push(b"\"y\"}");
        assert!(drain(&mut decoder).is_empty());

        let last = decoder.finish::<PullProgress>().unwrap().unwrap();
        assert_eq!(last.status, "y");
    }

    #[test]
    fn test_decoder_handles_split_utf8_and_blank_lines() {
        let text = "{\"status\":\"t\u{e9}l\u{e9}chargement\"}\n\r\n".as_bytes();
        let (a, b) = text.split_at(13);
        let mut decoder = NdjsonDecoder::new();
        decoder.push(a);
        let mut items = drain(&mut decoder);
        decoder.push(b);
        items.extend(drain(&mut decoder));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, "t\u{e9}l\u{e9}chargement");
    }

    #[test]
    fn test_decoder_yields_good_lines_before_malformed_one() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"{\"status\":\"ok\"}\nnot json\n{\"status\":\"after\"}\n");

        let first: PullProgress = decoder.next_item().unwrap().unwrap();
        assert_eq!(first.status, "ok");
        let bad = decoder.next_item::<PullProgress>();
        assert!(matches!(bad, Err(ProviderError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_pull_stream_reports_progress_before_malformed_line() {
        let stream = byte_stream(vec!["{\"status\":\"a\"}\nnot json\n"]);
        let mut seen = Vec::new();
        let result = parse_pull_stream(stream, &mut |p| seen.push(p), CancellationToken::new()).await;

        assert!(matches!(result, Err(ProviderError::InvalidResponse(_))));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, "a");
    }

    #[tokio::test]
    async fn test_chat_stream_keeps_partial_before_malformed_line() {
        let stream = byte_stream(vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"partial\"},\"done\":false}\n{oops\n",
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let result = parse_chat_stream(stream, tx, CancellationToken::new()).await;

        assert!(matches!(result, Err(ProviderError::InvalidResponse(_))));
        assert_eq!(rx.recv().await, Some(StreamEvent::Token("partial".to_string())));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_pull_stream_flushes_trailing_line() {
        let stream = byte_stream(vec![
            "{\"status\":\"pulling manifest\"}\n{\"status\":\"downloading\",",
            "\"digest\":\"sha256:1\",\"total\":100,\"completed\":40}\n",
            "{\"status\":\"success\"}",
        ]);
        let mut seen = Vec::new();
        parse_pull_stream(stream, &mut |p| seen.push(p), CancellationToken::new())
            .await
            .unwrap();

        let statuses: Vec<&str> = seen.iter().map(|p| p.status.as_str()).collect();
        assert_eq!(statuses, vec!["pulling manifest", "downloading", "success"]);
        assert_eq!(seen[1].percent(), Some(40));
    }

    #[tokio::test]
    async fn test_pull_stream_error_line_is_fatal() {
        let stream = byte_stream(vec!["{\"error\":\"pull model manifest: file does not exist\"}\n"]);
        let result = parse_pull_stream(stream, &mut |_| {}, CancellationToken::new()).await;
        assert!(matches!(result, Err(ProviderError::Daemon(_))));
    }

    #[tokio::test]
    async fn test_pull_stream_cancelled_reports_abort() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let result = parse_pull_stream(stream, &mut |_| {}, cancel).await;
        assert!(matches!(result, Err(ProviderError::Aborted)));
    }

    #[tokio::test]
    async fn test_chat_stream_forwards_thinking_and_tokens() {
        let stream = byte_stream(vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\",\"thinking\":\"Hmm\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":7,\"eval_count\":2}\n",
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        parse_chat_stream(stream, tx, CancellationToken::new())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::Thinking("Hmm".to_string()),
                StreamEvent::Token("Hel".to_string()),
                StreamEvent::Token("lo".to_string()),
                StreamEvent::Done {
                    prompt_tokens: Some(7),
                    completion_tokens: Some(2),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_stream_error_chunk_terminates() {
        let stream = byte_stream(vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"par\"},\"done\":false}\n",
            "{\"error\":\"model runner has unexpectedly stopped\"}\n",
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let result = parse_chat_stream(stream, tx, CancellationToken::new()).await;

        assert!(matches!(result, Err(ProviderError::Daemon(_))));
        assert_eq!(rx.recv().await, Some(StreamEvent::Token("par".to_string())));
    }
}
