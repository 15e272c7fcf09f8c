//! Server-sent events framing shared by the provider clients.

use crate::error::{LlmError, Result};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// `message` when the frame carried no `event:` line.
    pub event: String,
    pub data: String,
}

pub(crate) fn decode_sse<S, E>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some((idx, sep_len)) = find_frame_end(&buffer) {
                    let raw = buffer[..idx].to_string();
                    buffer.drain(..idx + sep_len);
                    match parse_frame(&raw) {
                        Some(event) => return Some((Ok(event), (stream, buffer))),
                        None => continue,
                    }
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => {
                        // Flush a trailing frame that was not blank-line terminated.
                        let rest = std::mem::take(&mut buffer);
                        return parse_frame(&rest).map(|event| (Ok(event), (stream, buffer)));
                    }
                }
            }
        },
    )
}

fn find_frame_end(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|idx| (idx, 2));
    let crlf = buffer.find("\r\n\r\n").map(|idx| (idx, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(raw: &str) -> Option<SseEvent> {
    let mut event = String::new();
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if event.is_empty() && data_lines.is_empty() {
        return None;
    }
    if event.is_empty() {
        event = "message".to_string();
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(
        parts: &[&str],
    ) -> impl Stream<Item = std::result::Result<Bytes, String>> + Send + Unpin + 'static {
        let owned: Vec<std::result::Result<Bytes, String>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        futures_util::stream::iter(owned)
    }

    #[tokio::test]
    async fn frames_split_across_network_chunks_are_reassembled() {
        let stream = decode_sse(chunks(&["data: {\"a\"", ":1}\n", "\ndata: [DONE]\n\n"]));
        let events: Vec<SseEvent> = stream.map(|e| e.expect("event")).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "[DONE]");
    }

    #[tokio::test]
    async fn named_events_and_comment_frames() {
        let stream = decode_sse(chunks(&[
            ": keepalive\n\n",
            "event: content_block_delta\r\ndata: {}\r\n\r\n",
            "event: message_stop\ndata: {}",
        ]));
        let events: Vec<SseEvent> = stream.map(|e| e.expect("event")).collect().await;
        assert_eq!(
            events.iter().map(|e| e.event.as_str()).collect::<Vec<_>>(),
            vec!["content_block_delta", "message_stop"]
        );
    }

    #[tokio::test]
    async fn transport_error_is_surfaced() {
        let parts: Vec<std::result::Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: x\n\n")),
            Err("connection reset".to_string()),
        ];
        let mut stream = Box::pin(decode_sse(futures_util::stream::iter(parts)));
        assert!(stream.next().await.expect("first").is_ok());
        let err = stream.next().await.expect("second").expect_err("error");
        assert!(matches!(err, LlmError::Http(msg) if msg.contains("connection reset")));
    }
}
