//! The conversation currently on screen.
//!
//! Switching conversations cancels the previous message and typing
//! subscriptions before the new ones are opened, so no update from the old
//! conversation can reach the new view.

use log::{debug, info};
use std::sync::Arc;

use super::chat_states::TypingSignal;
use super::message_stream::MessageStream;
use super::session::Session;
use super::subscription::Subscription;
use crate::error::Result;
use crate::models::Message;

/// Live state of the focused conversation
pub struct FocusedChat {
    pub conversation_id: String,
    pub messages: Subscription<Vec<Message>>,
    pub typing: Subscription<Vec<String>>,
}

pub struct ChatFocus {
    stream: MessageStream,
    typing: TypingSignal,
    current: Option<FocusedChat>,
}

impl ChatFocus {
    pub fn new(session: Arc<Session>) -> Self {
        ChatFocus {
            stream: MessageStream::new(session.clone()),
            typing: TypingSignal::new(session),
            current: None,
        }
    }

    /// Focus `conversation_id`, tearing down whatever was focused before.
    pub async fn select(&mut self, conversation_id: &str) -> Result<&mut FocusedChat> {
        self.clear().await;

        let messages = self.stream.subscribe(conversation_id).await?;
        let typing = self.typing.subscribe(conversation_id).await?;
        info!("Focused conversation {}", conversation_id);

        Ok(self.current.insert(FocusedChat {
            conversation_id: conversation_id.to_string(),
            messages,
            typing,
        }))
    }

    /// Drop the focus. Our own typing flag in the old conversation is
    /// cleared on a best-effort basis.
    pub async fn clear(&mut self) {
        if let Some(mut previous) = self.current.take() {
            previous.messages.cancel();
            previous.typing.cancel();
            if let Err(e) = self.typing.set_typing(&previous.conversation_id, false).await {
                debug!("Could not clear typing flag in {}: {}", previous.conversation_id, e);
            }
            debug!("Left conversation {}", previous.conversation_id);
        }
    }

    pub fn current(&self) -> Option<&FocusedChat> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut FocusedChat> {
        self.current.as_mut()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.conversation_id.as_str())
    }
}
