//! Client-side sync layer: session, live subscriptions and the per-feature
//! components that sit on top of the store.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{ChatError, Result};
use crate::models::Conversation;
use crate::store::{DocPath, Store};

pub mod calls;
pub mod chat_states;
pub mod delivery_receipts;
pub mod directory;
pub mod focus;
pub mod message_stream;
pub mod presence;
pub mod session;
pub mod status_updates;
pub mod subscription;

pub use calls::{CallDirection, CallEntry, CallLog};
pub use chat_states::TypingSignal;
pub use delivery_receipts::{DeliveryTracker, Visibility};
pub use directory::{ChatDirectory, ConversationSummary};
pub use focus::ChatFocus;
pub use message_stream::MessageStream;
pub use presence::{Presence, ProfileUpdate};
pub use session::Session;
pub use status_updates::{StatusBoard, StatusFeed};
pub use subscription::{
    CancelHandle, LiveOptions, Mapped, Projection, Subscription, SubscriptionRegistry, SyncEvent,
};

// Collection names
pub const USERS: &str = "users";
pub const CHATS: &str = "chats";
pub const STATUS: &str = "status";
pub const CALLS: &str = "calls";

/// Conversation field holding the commit sequence of the latest summary write
pub(crate) const SUMMARY_SEQ: &str = "summarySeq";

pub fn messages_collection(conversation_id: &str) -> String {
    format!("{}/{}/messages", CHATS, conversation_id)
}

pub fn typing_collection(conversation_id: &str) -> String {
    format!("{}/{}/typing", CHATS, conversation_id)
}

fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").ok())
        .as_ref()
}

/// Reject ids that would escape their collection or are empty.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    let valid = match id_pattern() {
        Some(pattern) => pattern.is_match(id),
        None => !id.is_empty() && !id.contains('/'),
    };
    if valid {
        Ok(())
    } else {
        Err(ChatError::InvalidArgument(format!("malformed {} id: {:?}", kind, id)))
    }
}

/// Read a conversation, failing with `NotFound` when absent.
pub(crate) async fn load_conversation(store: &dyn Store, conversation_id: &str) -> Result<Conversation> {
    validate_id("conversation", conversation_id)?;
    let doc = store
        .get(&DocPath::new(CHATS, conversation_id))
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
    Ok(Conversation::from_document(&doc)?)
}

/// Read a conversation and check that `uid` takes part in it.
pub(crate) async fn require_participant(
    store: &dyn Store,
    conversation_id: &str,
    uid: &str,
) -> Result<Conversation> {
    let conversation = load_conversation(store, conversation_id).await?;
    if !conversation.has_participant(uid) {
        return Err(ChatError::Unauthorized(format!(
            "{} is not a participant of {}",
            uid, conversation_id
        )));
    }
    Ok(conversation)
}
