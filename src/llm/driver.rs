// ABOUTME: The streaming loop shared by every provider adapter: start, send,
// ABOUTME: decode frames, feed the accumulator, and push exactly one terminal event.

use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::event_stream::{AssistantMessageEvent, EventSender, EventStream, event_channel};
use super::options::StreamOptions;
use super::sse::{SseDecoder, SseFrame};
use super::stream_accumulator::{Completion, StreamAccumulator};
use super::token::TokenProvider;
use super::{Model, transport};
use crate::error::LlmError;

/// Whether a frame ended the message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Flow {
    Continue,
    Finished(Completion),
}

/// Translation of one provider's frame union into accumulator calls.
pub(crate) trait WireFormat: Send + 'static {
    /// The closed set of frames this provider sends.
    type Frame: DeserializeOwned + Send;

    /// Handle one decoded frame.
    fn on_frame(
        &mut self,
        frame: Self::Frame,
        acc: &mut StreamAccumulator,
    ) -> (Vec<AssistantMessageEvent>, Flow);

    /// Decide the outcome once the body ends or `[DONE]` arrives without a
    /// finishing frame.
    fn on_end(&mut self, acc: &mut StreamAccumulator) -> (Vec<AssistantMessageEvent>, Completion);
}

/// A fully built request, ready to send.
#[derive(Debug)]
pub(crate) struct PreparedRequest {
    pub url: String,
    pub body: serde_json::Value,
}

/// Everything one streaming request needs, moved into its producer task.
pub(crate) struct StreamRequest<W> {
    pub http: reqwest::Client,
    pub tokens: Arc<dyn TokenProvider>,
    pub model: Model,
    pub options: StreamOptions,
    pub wire: W,
}

/// Start the producer task and hand back the consumer half.
///
/// A request construction failure in `prepared` becomes the stream's
/// terminal error. Must be called from within a tokio runtime.
pub(crate) fn spawn_stream<W: WireFormat>(
    request: StreamRequest<W>,
    prepared: Result<PreparedRequest, LlmError>,
) -> EventStream {
    let (mut sender, stream) = event_channel();
    tokio::spawn(async move {
        request.run(prepared, &mut sender).await;
        debug_assert!(sender.is_terminated(), "producer returned without a terminal event");
        sender.end();
    });
    stream
}

impl<W: WireFormat> StreamRequest<W> {
    async fn run(
        mut self,
        prepared: Result<PreparedRequest, LlmError>,
        sender: &mut EventSender,
    ) {
        let mut acc = StreamAccumulator::new(&self.model);
        sender.push(acc.start_event()).await;

        if self.options.signal.is_aborted() {
            debug!(model = %self.model.id, "request aborted before sending");
            sender.push_all(acc.finish(Completion::Aborted)).await;
            return;
        }

        let completion = match self.drive(prepared, &mut acc, sender).await {
            Ok(completion) => completion,
            Err(err) => {
                debug!(model = %self.model.id, error = %err, "stream failed");
                Completion::from(&err)
            }
        };
        let completion = if self.options.signal.is_aborted() {
            Completion::Aborted
        } else {
            completion
        };

        sender.push_all(acc.finish(completion)).await;
    }

    async fn drive(
        &mut self,
        prepared: Result<PreparedRequest, LlmError>,
        acc: &mut StreamAccumulator,
        sender: &mut EventSender,
    ) -> Result<Completion, LlmError> {
        let prepared = prepared?;
        if let Some(hook) = &self.options.on_payload {
            hook(&prepared.body);
        }

        let signal = self.options.signal.clone();
        let token = tokio::select! {
            biased;
            () = signal.aborted() => return Err(LlmError::Aborted),
            token = self.tokens.token() => token?,
        };
        let headers = transport::merge_headers(&self.model, &self.options, &token)?;

        debug!(
            api = %self.model.api,
            model = %self.model.id,
            url = %prepared.url,
            "sending streaming request"
        );
        let request = self
            .http
            .post(&prepared.url)
            .headers(headers)
            .json(&prepared.body);
        let response = transport::send(request, &signal).await?;
        let response = transport::check_status(response).await?;

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        loop {
            let chunk = tokio::select! {
                biased;
                () = signal.aborted() => return Err(LlmError::Aborted),
                chunk = body.next() => chunk,
            };

            let (frames, ended) = match chunk {
                Some(bytes) => (decoder.push(&bytes?), false),
                None => (decoder.finish().into_iter().collect(), true),
            };

            for frame in frames {
                if let Some(completion) = self.apply(frame, acc, sender).await {
                    return Ok(completion);
                }
            }

            if sender.is_closed() {
                debug!(model = %self.model.id, "consumer dropped, stopping transport read");
                return Err(LlmError::StreamClosed);
            }
            if ended {
                let (events, completion) = self.wire.on_end(acc);
                sender.push_all(events).await;
                return Ok(completion);
            }
        }
    }

    async fn apply(
        &mut self,
        frame: SseFrame,
        acc: &mut StreamAccumulator,
        sender: &mut EventSender,
    ) -> Option<Completion> {
        match frame {
            SseFrame::Done => {
                let (events, completion) = self.wire.on_end(acc);
                sender.push_all(events).await;
                Some(completion)
            }
            SseFrame::Data(json) => match serde_json::from_str::<W::Frame>(&json) {
                Ok(frame) => {
                    let (events, flow) = self.wire.on_frame(frame, acc);
                    sender.push_all(events).await;
                    match flow {
                        Flow::Continue => None,
                        Flow::Finished(completion) => Some(completion),
                    }
                }
                Err(e) => {
                    let err = LlmError::MalformedChunk(e.to_string());
                    warn!(model = %self.model.id, error = %err, frame = %json, "skipping frame");
                    None
                }
            },
        }
    }
}
