use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use tokio::time::Instant;

use crate::tree::WatchMessage;

/// Interleaves a `ping` whenever `every` passes without a message.
///
/// The result ends when `messages` ends.
pub fn with_keepalive<S>(
    messages: S,
    every: Duration,
) -> impl Stream<Item = WatchMessage> + Send + 'static
where
    S: Stream<Item = WatchMessage> + Send + 'static,
{
    let messages = Box::pin(messages);
    let deadline = Instant::now() + every;

    futures::stream::unfold((messages, deadline), move |(mut messages, deadline)| async move {
        tokio::select! {
            biased;
            message = messages.next() => {
                message.map(|message| (message, (messages, Instant::now() + every)))
            }
            _ = tokio::time::sleep_until(deadline) => {
                Some((WatchMessage::ping(), (messages, Instant::now() + every)))
            }
        }
    })
}

/// One NDJSON line per message
pub fn encode_ndjson(message: &WatchMessage) -> serde_json::Result<Bytes> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}
