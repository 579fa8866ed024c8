//! Streaming sessions: a chunked response body decoded into an ordered,
//! cancellable sequence of chat events.

use crate::error::{Error, Result};
use crate::event::ChatEvent;
use crate::framing::{FrameBuffer, Framing};
use async_stream::stream;
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// An ordered stream of decoded events. The first `Err` item is terminal:
/// nothing follows it.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChatEvent>> + Send>>;

/// Decode a stream of body chunks into an event stream.
///
/// Chunk boundaries are immaterial: frames split across chunks are carried
/// forward by the [`FrameBuffer`]. A transport error, an undecodable byte
/// sequence, or a frame matching no schema terminates the session with
/// exactly one `Err`. Cancellation stops decoding immediately; nothing is
/// yielded after it, not even a terminal error.
pub fn decode_frames<S, B>(chunks: S, framing: Framing, cancel: CancellationToken) -> EventStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    Box::pin(stream! {
        let mut buffer = FrameBuffer::new(framing);
        let mut chunks = std::pin::pin!(chunks);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = chunks.next() => next,
            };
            let Some(next) = next else { break };

            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(Error::Http(e));
                    return;
                }
            };

            let frames = match buffer.push(chunk.as_ref()) {
                Ok(frames) => frames,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            for frame in frames {
                if cancel.is_cancelled() {
                    return;
                }
                match ChatEvent::decode(&frame) {
                    Ok(event) => yield Ok(event),
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        match buffer.finish() {
            Ok(Some(frame)) => match ChatEvent::decode(&frame) {
                Ok(event) => yield Ok(event),
                Err(e) => yield Err(e),
            },
            Ok(None) => {}
            Err(e) => yield Err(e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Role;

    fn chunk_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = reqwest::Result<&'static [u8]>> + Send {
        futures::stream::iter(chunks.into_iter().map(Ok))
    }

    async fn decode_all(chunks: Vec<&'static [u8]>) -> Vec<Result<ChatEvent>> {
        decode_frames(
            chunk_stream(chunks),
            Framing::Newline,
            CancellationToken::new(),
        )
        .collect()
        .await
    }

    #[tokio::test]
    async fn test_events_in_arrival_order() {
        let items = decode_all(vec![
            b"{\"type\":\"message\",\"role\":\"assistant\",\"text\":\"Hel\"}\n",
            b"{\"type\":\"message\",\"role\":\"assis",
            b"tant\",\"text\":\"lo\"}\n{\"type\":\"endConversation\"}\n",
        ])
        .await;

        assert_eq!(items.len(), 3);
        assert!(matches!(
            items[0].as_ref().unwrap(),
            ChatEvent::Message { role: Role::Assistant, text: Some(t), .. } if t == "Hel"
        ));
        assert!(matches!(
            items[1].as_ref().unwrap(),
            ChatEvent::Message { text: Some(t), .. } if t == "lo"
        ));
        assert!(matches!(
            items[2].as_ref().unwrap(),
            ChatEvent::EndConversation
        ));
    }

    #[tokio::test]
    async fn test_decode_failure_is_terminal() {
        let items = decode_all(vec![
            b"{\"type\":\"message\",\"role\":\"assistant\",\"text\":\"ok\"}\n",
            b"{\"type\":\"mystery\"}\n",
            b"{\"type\":\"endConversation\"}\n",
        ])
        .await;

        // One good event, then exactly one error, then nothing.
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1].as_ref().unwrap_err(),
            Error::InvalidChatUpdate { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_terminal() {
        let items = decode_all(vec![b"\xff\xfe\n"]).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0].as_ref().unwrap_err(),
            Error::InvalidUtf8(_)
        ));
    }

    #[tokio::test]
    async fn test_unterminated_trailing_frame_flushed() {
        let items = decode_all(vec![b"{\"type\":\"endConversation\"}"]).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0].as_ref().unwrap(),
            ChatEvent::EndConversation
        ));
    }

    #[tokio::test]
    async fn test_cancellation_yields_nothing_further() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items: Vec<_> = decode_frames(
            chunk_stream(vec![b"{\"type\":\"endConversation\"}\n"]),
            Framing::Newline,
            cancel,
        )
        .collect()
        .await;
        assert!(items.is_empty());
    }
}
