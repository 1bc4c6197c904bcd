//! Delivery status transitions: sent -> delivered -> seen.
//!
//! Only a receiving participant moves a message forward. Every write is a
//! compare-and-set on the status it read, so a late `delivered` can never
//! overwrite a `seen` that landed first.

use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;

use super::session::Session;
use super::{messages_collection, require_participant, validate_id, CHATS};
use crate::error::{ChatError, Result, StoreError};
use crate::models::{DeliveryStatus, Message};
use crate::store::{DocPath, Patch, Precondition, WriteBatch};

// Attempts before a contended status write gives up
const MAX_ATTEMPTS: u32 = 3;

/// Whether the receiving client currently shows the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Background,
    Visible,
}

impl Visibility {
    fn target(self) -> DeliveryStatus {
        match self {
            Visibility::Background => DeliveryStatus::Delivered,
            Visibility::Visible => DeliveryStatus::Seen,
        }
    }
}

pub struct DeliveryTracker {
    session: Arc<Session>,
}

impl DeliveryTracker {
    pub fn new(session: Arc<Session>) -> Self {
        DeliveryTracker { session }
    }

    /// Returns whether the status changed; already delivered or seen is `Ok(false)`.
    pub async fn mark_delivered(&self, conversation_id: &str, message_id: &str) -> Result<bool> {
        self.mark(conversation_id, message_id, DeliveryStatus::Delivered).await
    }

    pub async fn mark_seen(&self, conversation_id: &str, message_id: &str) -> Result<bool> {
        self.mark(conversation_id, message_id, DeliveryStatus::Seen).await
    }

    async fn mark(&self, conversation_id: &str, message_id: &str, target: DeliveryStatus) -> Result<bool> {
        let uid = self.session.require_uid()?;
        validate_id("message", message_id)?;
        require_participant(self.session.store().as_ref(), conversation_id, &uid).await?;
        self.advance(&uid, conversation_id, message_id, target).await
    }

    async fn advance(
        &self,
        uid: &str,
        conversation_id: &str,
        message_id: &str,
        target: DeliveryStatus,
    ) -> Result<bool> {
        let store = self.session.store();
        let path = DocPath::new(&messages_collection(conversation_id), message_id);

        for attempt in 1..=MAX_ATTEMPTS {
            let doc = store
                .get(&path)
                .await?
                .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
            let message = Message::from_document(&doc)?;

            if message.sender_id == uid {
                return Err(ChatError::Unauthorized(format!(
                    "{} cannot acknowledge their own message {}",
                    uid, message_id
                )));
            }
            if !message.delivery_status.can_advance_to(target) {
                debug!(
                    "Message {} already {}, not moving to {}",
                    message_id,
                    message.delivery_status.as_str(),
                    target.as_str()
                );
                return Ok(false);
            }

            let batch = WriteBatch::new().update_if(
                path.clone(),
                Patch::new().set("deliveryStatus", target.as_str()),
                Precondition {
                    field: "deliveryStatus".to_string(),
                    equals: json!(message.delivery_status.as_str()),
                },
            );
            match store.commit(batch).await {
                Ok(_) => {
                    debug!("Message {} marked {}", message_id, target.as_str());
                    return Ok(true);
                }
                Err(StoreError::PreconditionFailed { .. }) => {
                    debug!("Status of {} changed underneath us (attempt {})", message_id, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!("Giving up on status update for {} after {} attempts", message_id, MAX_ATTEMPTS);
        Err(ChatError::Unavailable(format!("status of message {} kept changing", message_id)))
    }

    /// Acknowledge every incoming message of a snapshot: delivered while the
    /// conversation is in the background, seen while it is visible. A visible
    /// conversation also has the caller's unread counter reset. A message
    /// that cannot be moved is logged and skipped.
    /// Returns how many messages moved.
    pub async fn acknowledge(
        &self,
        conversation_id: &str,
        messages: &[Message],
        visibility: Visibility,
    ) -> Result<usize> {
        let uid = self.session.require_uid()?;
        let store = self.session.store();
        let conversation = require_participant(store.as_ref(), conversation_id, &uid).await?;
        let target = visibility.target();

        let mut advanced = 0;
        for message in messages
            .iter()
            .filter(|m| m.sender_id != uid && m.delivery_status.can_advance_to(target))
        {
            match self.advance(&uid, conversation_id, &message.id, target).await {
                Ok(true) => advanced += 1,
                Ok(false) => {}
                Err(e) => warn!("Could not mark {} as {}: {}", message.id, target.as_str(), e),
            }
        }

        if visibility == Visibility::Visible && conversation.unread_for(&uid) > 0 {
            store
                .update(
                    &DocPath::new(CHATS, conversation_id),
                    Patch::new().set(&format!("unread.{}", uid), 0),
                )
                .await?;
        }

        if advanced > 0 {
            info!("Marked {} messages in {} as {}", advanced, conversation_id, target.as_str());
        }
        Ok(advanced)
    }
}
