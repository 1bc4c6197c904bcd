//! Live message history of one conversation and the send path.

use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use super::session::Session;
use super::subscription::{Mapped, Subscription};
use super::{messages_collection, require_participant, CHATS, SUMMARY_SEQ};
use crate::error::{ChatError, Result, StoreError};
use crate::models::{Conversation, DeliveryStatus, Message, MessageKind, MessageView};
use crate::store::{to_fields, DocPath, Direction, Document, Patch, Query, TieBreak, WriteBatch};

fn decode_messages(docs: &[Document]) -> std::result::Result<Vec<Message>, StoreError> {
    let mut messages = Vec::with_capacity(docs.len());
    for doc in docs {
        match Message::from_document(doc) {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Skipping unreadable message: {}", e),
        }
    }
    Ok(messages)
}

pub struct MessageStream {
    session: Arc<Session>,
}

impl MessageStream {
    pub fn new(session: Arc<Session>) -> Self {
        MessageStream { session }
    }

    /// Live, ordered messages of a conversation the caller takes part in.
    /// Equal timestamps keep commit order.
    pub async fn subscribe(&self, conversation_id: &str) -> Result<Subscription<Vec<Message>>> {
        let uid = self.session.require_uid()?;
        require_participant(self.session.store().as_ref(), conversation_id, &uid).await?;

        let query = Query::collection(&messages_collection(conversation_id)).order_by(
            "timestamp",
            Direction::Asc,
            TieBreak::Created,
        );
        let label = format!("messages:{}", conversation_id);
        Ok(self.session.live(query, Mapped::new(decode_messages), &label))
    }

    /// Send a message. The message and the conversation summary commit in
    /// one batch.
    pub async fn send(&self, conversation_id: &str, content: &str, kind: MessageKind) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::InvalidArgument("message content is empty".to_string()));
        }

        let uid = self.session.require_uid()?;
        let conversation = require_participant(self.session.store().as_ref(), conversation_id, &uid).await?;
        self.commit_message(&uid, &conversation, content.to_string(), kind, None, content.to_string())
            .await
    }

    /// Upload a media payload and send it as a message of `kind`.
    pub async fn send_media(
        &self,
        conversation_id: &str,
        bytes: Vec<u8>,
        kind: MessageKind,
        caption: &str,
    ) -> Result<Message> {
        if !kind.is_media() {
            return Err(ChatError::InvalidArgument("media messages need a media kind".to_string()));
        }
        if bytes.is_empty() {
            return Err(ChatError::InvalidArgument("media payload is empty".to_string()));
        }

        let uid = self.session.require_uid()?;
        let store = self.session.store();
        let conversation = require_participant(store.as_ref(), conversation_id, &uid).await?;

        let blob_path = format!("{}/{}/media/{}", CHATS, conversation_id, Uuid::new_v4());
        let size = bytes.len();
        let url = store.upload_blob(&blob_path, bytes).await?;
        debug!("Uploaded {} bytes for {}", size, conversation_id);

        let caption = caption.trim();
        let summary = if caption.is_empty() {
            kind.label().to_string()
        } else {
            caption.to_string()
        };
        self.commit_message(&uid, &conversation, caption.to_string(), kind, Some(url), summary)
            .await
    }

    async fn commit_message(
        &self,
        sender: &str,
        conversation: &Conversation,
        content: String,
        kind: MessageKind,
        media_url: Option<String>,
        summary: String,
    ) -> Result<Message> {
        let now = self.session.clock().now();
        let mut message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            seq: 0,
            sender_id: sender.to_string(),
            content,
            kind,
            media_url,
            delivery_status: DeliveryStatus::Sent,
            timestamp: now,
        };

        let mut patch = Patch::new()
            .set("lastMessage", summary)
            .set("lastMessageTime", now.timestamp_millis())
            .stamp_seq(SUMMARY_SEQ);
        for other in conversation.others(sender) {
            patch = patch.increment(&format!("unread.{}", other), 1);
        }

        let path = DocPath::new(&messages_collection(&conversation.id), &message.id);
        // Summary first, so the returned sequence is the message's own
        let batch = WriteBatch::new()
            .update(DocPath::new(CHATS, &conversation.id), patch)
            .create(path.clone(), to_fields(&path, &message)?);
        message.seq = self.session.store().commit(batch).await?;

        info!("Sent message {} to {}", message.id, conversation.id);
        Ok(message)
    }

    /// Presentation model of `message` for the signed-in identity.
    pub fn view(&self, message: Message) -> Result<MessageView> {
        let uid = self.session.require_uid()?;
        Ok(MessageView::new(message, &uid))
    }
}
