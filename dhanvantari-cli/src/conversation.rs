use crate::client::StreamEvent;
use crate::error::ChatError;
use dhanvantari_shared::{ApiMessage, ChatMessage, MessageRole};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Id prefix marking the assistant message that is still being streamed.
pub const STREAMING_PREFIX: &str = "streaming-";

pub const GREETING: &str = "नमस्ते! 🙏 I am Dhanvantari, your sacred guide to natural healing. \
How may I assist you on your wellness journey today?\n\n\
You can describe your symptoms, ask about home remedies, or inquire about Ayurvedic practices. \
I can respond in Hindi, Tamil, Telugu, Bengali, and many other Indian languages.";

/// The one user-facing message produced by a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    RateLimited,
    CreditsExhausted,
    Failed,
}

impl Notice {
    pub fn message(&self) -> &'static str {
        match self {
            Notice::RateLimited => {
                "Rate limit exceeded. Please wait a moment before trying again."
            }
            Notice::CreditsExhausted => "AI credits exhausted. Please add credits to continue.",
            Notice::Failed => "Failed to get response. Please try again.",
        }
    }
}

impl From<&ChatError> for Notice {
    fn from(err: &ChatError) -> Self {
        match err {
            ChatError::RateLimited(_) => Notice::RateLimited,
            ChatError::CreditsExhausted(_) => Notice::CreditsExhausted,
            _ => Notice::Failed,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

fn new_id() -> String {
    Uuid::now_v7().to_string()
}

fn is_streaming(msg: &ChatMessage) -> bool {
    msg.role == MessageRole::Assistant && msg.id.starts_with(STREAMING_PREFIX)
}

/// Message list of one chat session.
///
/// The list is shared copy-on-write: a [`Conversation::snapshot`] taken by a
/// renderer never changes, later updates clone the list first.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Arc<Vec<ChatMessage>>,
    busy: bool,
    // User message of the exchange in flight, and whether any reply text
    // has arrived for it yet.
    pending_user: Option<String>,
    answered: bool,
}

impl Conversation {
    pub fn with_greeting() -> Self {
        Self {
            messages: Arc::new(vec![ChatMessage::new(
                "1",
                MessageRole::Assistant,
                GREETING,
            )]),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn snapshot(&self) -> Arc<Vec<ChatMessage>> {
        Arc::clone(&self.messages)
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// History in the shape the chat endpoint expects.
    pub fn api_messages(&self) -> Vec<ApiMessage> {
        self.messages.iter().map(ApiMessage::from).collect()
    }

    /// Append a user message and mark the session busy.
    ///
    /// Returns `None` (and changes nothing) for blank text or while a
    /// request is already in flight.
    pub fn append_user_message(&mut self, text: &str) -> Option<&ChatMessage> {
        if text.trim().is_empty() || self.busy {
            return None;
        }

        let message = ChatMessage::new(new_id(), MessageRole::User, text);
        self.pending_user = Some(message.id.clone());
        self.answered = false;
        self.busy = true;

        let messages = Arc::make_mut(&mut self.messages);
        messages.push(message);
        messages.last()
    }

    pub fn on_delta(&mut self, delta: &str) {
        self.answered = true;
        let messages = Arc::make_mut(&mut self.messages);
        match messages.last_mut() {
            Some(last) if is_streaming(last) => {
                last.content = format!("{}{}", last.content, delta);
            }
            _ => messages.push(ChatMessage::new(
                format!("{}{}", STREAMING_PREFIX, new_id()),
                MessageRole::Assistant,
                delta,
            )),
        }
    }

    pub fn on_stream_end(&mut self) {
        self.finalize_streaming();
        self.busy = false;
        self.pending_user = None;
    }

    /// Clear the busy flag and roll back the user message when nothing was
    /// answered. Returns the notice to show.
    pub fn on_transport_error(&mut self, err: &ChatError) -> Notice {
        warn!("Chat request failed: {}", err);
        self.busy = false;

        if let Some(id) = self.pending_user.take() {
            if self.answered {
                self.finalize_streaming();
            } else {
                debug!("Rolling back user message {}", id);
                Arc::make_mut(&mut self.messages).retain(|m| m.id != id);
            }
        }

        Notice::from(err)
    }

    /// Owner-initiated stop; keeps whatever part of the answer arrived.
    pub fn cancel(&mut self) {
        if !self.busy {
            return;
        }
        debug!("Cancelling in-flight exchange");
        let pending = self.pending_user.take();
        if self.answered {
            self.finalize_streaming();
        } else if let Some(id) = pending {
            Arc::make_mut(&mut self.messages).retain(|m| m.id != id);
        }
        self.busy = false;
    }

    pub fn apply(&mut self, event: StreamEvent) -> Option<Notice> {
        match event {
            StreamEvent::Delta(delta) => {
                self.on_delta(&delta);
                None
            }
            StreamEvent::Done => {
                self.on_stream_end();
                None
            }
            StreamEvent::Failed(err) => Some(self.on_transport_error(&err)),
        }
    }

    fn finalize_streaming(&mut self) {
        if !self.messages.last().is_some_and(is_streaming) {
            return;
        }
        if let Some(last) = Arc::make_mut(&mut self.messages).last_mut() {
            last.id = new_id();
        }
    }
}
