// ABOUTME: The canonical event union and the single-producer/single-consumer
// ABOUTME: channel that delivers it, ending with exactly one terminal event.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::{AssistantMessage, StopReason, ToolCall};
use crate::error::LlmError;

const CHANNEL_CAPACITY: usize = 64;

/// One step in the construction of an assistant message.
///
/// Every variant except the terminal ones carries a `partial` snapshot of the
/// message as of that event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AssistantMessageEvent {
    Start {
        partial: AssistantMessage,
    },
    TextStart {
        block_index: usize,
        partial: AssistantMessage,
    },
    TextDelta {
        block_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    TextEnd {
        block_index: usize,
        content: String,
        partial: AssistantMessage,
    },
    ThinkingStart {
        block_index: usize,
        partial: AssistantMessage,
    },
    ThinkingDelta {
        block_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ThinkingEnd {
        block_index: usize,
        content: String,
        partial: AssistantMessage,
    },
    ToolcallStart {
        block_index: usize,
        partial: AssistantMessage,
    },
    ToolcallEnd {
        block_index: usize,
        tool_call: ToolCall,
        partial: AssistantMessage,
    },
    Done {
        reason: StopReason,
        message: AssistantMessage,
    },
    Error {
        reason: StopReason,
        error: AssistantMessage,
    },
}

impl AssistantMessageEvent {
    /// True for `done` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// The message snapshot this event carries.
    pub fn message(&self) -> &AssistantMessage {
        match self {
            Self::Start { partial }
            | Self::TextStart { partial, .. }
            | Self::TextDelta { partial, .. }
            | Self::TextEnd { partial, .. }
            | Self::ThinkingStart { partial, .. }
            | Self::ThinkingDelta { partial, .. }
            | Self::ThinkingEnd { partial, .. }
            | Self::ToolcallStart { partial, .. }
            | Self::ToolcallEnd { partial, .. } => partial,
            Self::Done { message, .. } => message,
            Self::Error { error, .. } => error,
        }
    }

    /// Content block index, for block-level events.
    pub fn block_index(&self) -> Option<usize> {
        match self {
            Self::TextStart { block_index, .. }
            | Self::TextDelta { block_index, .. }
            | Self::TextEnd { block_index, .. }
            | Self::ThinkingStart { block_index, .. }
            | Self::ThinkingDelta { block_index, .. }
            | Self::ThinkingEnd { block_index, .. }
            | Self::ToolcallStart { block_index, .. }
            | Self::ToolcallEnd { block_index, .. } => Some(*block_index),
            _ => None,
        }
    }

    /// The wire name of this event's type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextStart { .. } => "text_start",
            Self::TextDelta { .. } => "text_delta",
            Self::TextEnd { .. } => "text_end",
            Self::ThinkingStart { .. } => "thinking_start",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ThinkingEnd { .. } => "thinking_end",
            Self::ToolcallStart { .. } => "toolcall_start",
            Self::ToolcallEnd { .. } => "toolcall_end",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Consume a terminal event into its message.
    pub fn into_terminal_message(self) -> Option<AssistantMessage> {
        match self {
            Self::Done { message, .. } => Some(message),
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Create a connected producer/consumer pair.
pub fn event_channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        EventSender {
            tx,
            terminated: false,
        },
        EventStream { rx, finished: false },
    )
}

/// Producer half. Owned by exactly one adapter task.
pub struct EventSender {
    tx: mpsc::Sender<AssistantMessageEvent>,
    terminated: bool,
}

impl EventSender {
    /// Deliver an event, waiting if the consumer is behind.
    ///
    /// # Panics
    ///
    /// Panics if a terminal event has already been pushed.
    pub async fn push(&mut self, event: AssistantMessageEvent) {
        assert!(
            !self.terminated,
            "event '{}' pushed after the terminal event",
            event.kind()
        );
        self.terminated = event.is_terminal();
        if self.tx.send(event).await.is_err() {
            debug!("event stream consumer dropped");
        }
    }

    /// Deliver several events in order.
    pub async fn push_all(&mut self, events: impl IntoIterator<Item = AssistantMessageEvent>) {
        for event in events {
            self.push(event).await;
        }
    }

    /// True once the terminal event has been pushed.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// True if the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the stream. Consumes the sender, so it happens at most once.
    pub fn end(self) {
        if !self.terminated {
            debug!("event stream ended without a terminal event");
        }
    }
}

/// Consumer half: a lazy, finite, non-restartable sequence of events.
///
/// Iteration stops after the terminal event.
pub struct EventStream {
    rx: mpsc::Receiver<AssistantMessageEvent>,
    finished: bool,
}

impl EventStream {
    /// Wait for the terminal event and return its message.
    ///
    /// A terminal `error` event is a successful result here: the returned
    /// message has `stop_reason` `Error` or `Aborted` and `error_message` set.
    pub async fn result(self) -> Result<AssistantMessage, LlmError> {
        self.for_each_event(|_| {}).await
    }

    /// Drive the stream, calling `f` synchronously for every event, and
    /// return the terminal message.
    pub async fn for_each_event<F>(mut self, mut f: F) -> Result<AssistantMessage, LlmError>
    where
        F: FnMut(&AssistantMessageEvent),
    {
        while let Some(event) = self.next().await {
            f(&event);
            if let Some(message) = event.into_terminal_message() {
                return Ok(message);
            }
        }
        Err(LlmError::StreamClosed)
    }
}

impl Stream for EventStream {
    type Item = AssistantMessageEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                    this.rx.close();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready};

    use super::*;
    use crate::llm::{Api, Model};

    fn partial() -> AssistantMessage {
        let model = Model::new(Api::OpenaiCompletions, "openai", "gpt-4o", "http://localhost");
        AssistantMessage::empty(&model)
    }

    #[tokio::test]
    async fn test_events_delivered_in_push_order() {
        let (mut tx, rx) = event_channel();

        tx.push(AssistantMessageEvent::Start { partial: partial() }).await;
        tx.push(AssistantMessageEvent::TextStart {
            block_index: 0,
            partial: partial(),
        })
        .await;
        tx.push(AssistantMessageEvent::Done {
            reason: StopReason::Stop,
            message: partial(),
        })
        .await;
        tx.end();

        let kinds: Vec<_> = rx.map(|e| e.kind()).collect().await;
        assert_eq!(kinds, vec!["start", "text_start", "done"]);
    }

    #[tokio::test]
    async fn test_consumer_suspends_until_next_event() {
        let (mut tx, mut rx) = event_channel();

        {
            let mut next = tokio_test::task::spawn(rx.next());
            assert_pending!(next.poll());

            tx.push(AssistantMessageEvent::Start { partial: partial() }).await;
            assert!(next.is_woken());
            let event = assert_ready!(next.poll());
            assert_eq!(event.map(|e| e.kind()), Some("start"));
        }

        tx.push(AssistantMessageEvent::Error {
            reason: StopReason::Aborted,
            error: partial(),
        })
        .await;
        assert_eq!(rx.next().await.map(|e| e.kind()), Some("error"));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "pushed after the terminal event")]
    async fn test_push_after_terminal_panics() {
        let (mut tx, _rx) = event_channel();
        tx.push(AssistantMessageEvent::Done {
            reason: StopReason::Stop,
            message: partial(),
        })
        .await;
        tx.push(AssistantMessageEvent::Start { partial: partial() }).await;
    }

    #[tokio::test]
    async fn test_result_returns_terminal_message() {
        let (mut tx, rx) = event_channel();
        let mut failed = partial();
        failed.stop_reason = StopReason::Error;
        failed.error_message = Some("boom".into());

        tx.push(AssistantMessageEvent::Start { partial: partial() }).await;
        tx.push(AssistantMessageEvent::Error {
            reason: StopReason::Error,
            error: failed.clone(),
        })
        .await;
        tx.end();

        let message = rx.result().await.unwrap();
        assert_eq!(message, failed);
    }

    #[tokio::test]
    async fn test_result_without_terminal_is_stream_closed() {
        let (mut tx, rx) = event_channel();
        tx.push(AssistantMessageEvent::Start { partial: partial() }).await;
        tx.end();

        assert!(matches!(rx.result().await, Err(LlmError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_for_each_event_sees_every_event() {
        let (mut tx, rx) = event_channel();
        tokio::spawn(async move {
            tx.push(AssistantMessageEvent::Start { partial: partial() }).await;
            tx.push(AssistantMessageEvent::Done {
                reason: StopReason::Stop,
                message: partial(),
            })
            .await;
            tx.end();
        });

        let mut seen = Vec::new();
        let message = rx.for_each_event(|e| seen.push(e.kind())).await.unwrap();
        assert_eq!(seen, vec!["start", "done"]);
        assert_eq!(message.stop_reason, StopReason::Stop);
    }

    #[tokio::test]
    async fn test_sender_sees_dropped_consumer() {
        let (tx, rx) = event_channel();
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
    }

    #[test]
    fn test_event_serialization() {
        let event = AssistantMessageEvent::TextDelta {
            block_index: 2,
            delta: "hi".into(),
            partial: partial(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["blockIndex"], 2);
        assert_eq!(json["delta"], "hi");
        assert_eq!(json["partial"]["api"], "openai-completions");

        let event = AssistantMessageEvent::ToolcallStart {
            block_index: 0,
            partial: partial(),
        };
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "toolcall_start");
    }
}
