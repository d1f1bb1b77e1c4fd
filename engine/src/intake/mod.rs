//! Message intake
//!
//! Pull-based source of user requests. A `ToolPollSource` calls a
//! message-receiving tool through the registry on an interval and yields each
//! new message once. Running sessions and replying is left to the caller.

use futures::stream::{self, Stream};
use sdk::types::{ToolCall, ToolResult};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tools::ToolRegistry;

/// Message ids remembered for de-duplication
const SEEN_CAPACITY: usize = 1024;

/// A message received from a polled tool
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub text: String,
    pub chat_id: Option<String>,
    pub message_id: Option<i64>,
}

impl IncomingMessage {
    /// Arguments for a reply tool taking `{input: {chat_id, text}}`
    pub fn reply_arguments(&self, text: &str) -> Option<Value> {
        let chat_id = self.chat_id.as_ref()?;
        Some(serde_json::json!({
            "input": {
                "chat_id": chat_id,
                "text": text,
            }
        }))
    }
}

/// Extract a message from a poll result.
///
/// Accepts `{message, chat_id, message_id}` objects, a JSON object embedded
/// in a string, or a bare non-empty string. Failed calls, empty text and
/// `ERROR` replies yield nothing.
pub fn parse_message(result: &ToolResult) -> Option<IncomingMessage> {
    if !result.success {
        return None;
    }

    let message = match &result.value {
        Value::Object(_) => from_object(&result.value),
        Value::String(s) => match crate::llm::extract_json_object(s) {
            Some(obj) if obj.get("message").is_some() => from_object(&obj),
            _ => Some(IncomingMessage {
                text: s.trim().to_string(),
                chat_id: None,
                message_id: None,
            }),
        },
        _ => None,
    }?;

    if message.text.is_empty() || message.text.starts_with("ERROR") {
        return None;
    }
    Some(message)
}

fn from_object(obj: &Value) -> Option<IncomingMessage> {
    let text = obj.get("message")?.as_str()?.trim().to_string();
    let chat_id = match obj.get("chat_id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let message_id = obj
        .get("message_id")
        .and_then(Value::as_i64)
        .filter(|id| *id != 0);

    Some(IncomingMessage {
        text,
        chat_id,
        message_id,
    })
}

/// Polls one tool for new messages
pub struct ToolPollSource {
    registry: Arc<ToolRegistry>,
    call: ToolCall,
    interval: Duration,
    seen: HashSet<i64>,
    seen_order: VecDeque<i64>,
}

impl ToolPollSource {
    pub fn new(registry: Arc<ToolRegistry>, tool: impl Into<String>, interval: Duration) -> Self {
        Self {
            registry,
            call: ToolCall::new(tool, Value::Object(Default::default())),
            interval,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Poll once; `None` when nothing new arrived
    pub async fn poll_once(&mut self) -> Option<IncomingMessage> {
        let dispatched = self.registry.dispatch(&self.call).await;
        if !dispatched.result.success {
            warn!(
                tool = %self.call.name,
                error = %dispatched.result.text(),
                "Message poll failed"
            );
            return None;
        }

        let message = parse_message(&dispatched.result)?;
        if let Some(id) = message.message_id {
            if !self.mark_seen(id) {
                debug!(tool = %self.call.name, message_id = id, "Skipping already seen message");
                return None;
            }
        }
        Some(message)
    }

    /// Wait for the next new message; `None` once cancelled
    pub async fn next_message(&mut self, cancel: &CancellationToken) -> Option<IncomingMessage> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                polled = self.poll_once() => polled,
            };
            if polled.is_some() {
                return polled;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Messages as a stream that ends on cancellation
    pub fn into_stream(self, cancel: CancellationToken) -> impl Stream<Item = IncomingMessage> {
        stream::unfold((self, cancel), |(mut source, cancel)| async move {
            let message = source.next_message(&cancel).await?;
            Some((message, (source, cancel)))
        })
    }

    /// Record an id; false when it was already seen
    fn mark_seen(&mut self, id: i64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}
