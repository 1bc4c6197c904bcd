//! Conversation list, conversation creation and user lookup.

use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::session::Session;
use super::subscription::{Projection, Subscription};
use super::{require_participant, validate_id, CHATS, SUMMARY_SEQ, USERS};
use crate::error::{ChatError, Result, StoreError};
use crate::models::{Conversation, Identity};
use crate::store::{to_fields, DocPath, Document, Direction, Filter, Query, TieBreak, WriteBatch};

const SEARCH_LIMIT: usize = 20;

/// One row of the conversation list, as seen by one identity
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub unread: u32,
    pub others: Vec<String>,
}

impl ConversationSummary {
    pub fn id(&self) -> &str {
        &self.conversation.id
    }
}

struct DirectoryProjection {
    viewer: String,
}

impl Projection for DirectoryProjection {
    type Output = Vec<ConversationSummary>;

    fn project(&mut self, docs: &[Document]) -> std::result::Result<Option<Self::Output>, StoreError> {
        let mut summaries = Vec::with_capacity(docs.len());
        for doc in docs {
            let conversation = match Conversation::from_document(doc) {
                Ok(conversation) => conversation,
                Err(e) => {
                    warn!("Skipping unreadable conversation: {}", e);
                    continue;
                }
            };
            // The query already filters on membership; never trust it alone
            if !conversation.has_participant(&self.viewer) {
                continue;
            }
            summaries.push(ConversationSummary {
                unread: conversation.unread_for(&self.viewer),
                others: conversation.others(&self.viewer),
                conversation,
            });
        }
        debug!("Directory for {} has {} conversations", self.viewer, summaries.len());
        Ok(Some(summaries))
    }
}

pub struct ChatDirectory {
    session: Arc<Session>,
}

impl ChatDirectory {
    pub fn new(session: Arc<Session>) -> Self {
        ChatDirectory { session }
    }

    /// Live list of the signed-in identity's conversations, most recent first.
    pub fn subscribe(&self) -> Result<Subscription<Vec<ConversationSummary>>> {
        let uid = self.session.require_uid()?;
        let query = Query::collection(CHATS)
            .filter(Filter::ArrayContains("participants".to_string(), json!(uid)))
            .order_by(
                "lastMessageTime",
                Direction::Desc,
                TieBreak::Field(SUMMARY_SEQ.to_string()),
            );
        let label = format!("directory:{}", uid);
        Ok(self.session.live(query, DirectoryProjection { viewer: uid }, &label))
    }

    /// Start a conversation between the caller and `others`. Returns its id.
    pub async fn create_conversation(&self, others: &[&str]) -> Result<String> {
        let uid = self.session.require_uid()?;
        let store = self.session.store();

        let mut participants: Vec<String> = others.iter().map(|s| s.to_string()).collect();
        participants.push(uid.clone());
        for participant in &participants {
            validate_id("user", participant)?;
        }
        participants.sort();
        participants.dedup();
        if participants.len() < 2 {
            return Err(ChatError::InvalidArgument(
                "a conversation needs at least two participants".to_string(),
            ));
        }

        for participant in participants.iter().filter(|p| **p != uid) {
            if store.get(&DocPath::new(USERS, participant)).await?.is_none() {
                return Err(ChatError::NotFound(format!("identity {}", participant)));
            }
        }

        let now = self.session.clock().now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            unread: participants.iter().map(|p| (p.clone(), 0)).collect(),
            participants,
            last_message: String::new(),
            last_message_time: now,
            created_at: now,
        };
        let path = DocPath::new(CHATS, &conversation.id);
        store
            .commit(WriteBatch::new().create(path.clone(), to_fields(&path, &conversation)?))
            .await?;

        info!(
            "Created conversation {} with {} participants",
            conversation.id,
            conversation.participants.len()
        );
        Ok(conversation.id)
    }

    /// The existing two-party conversation with `other`, if any.
    pub async fn find_direct(&self, other: &str) -> Result<Option<Conversation>> {
        let uid = self.session.require_uid()?;
        validate_id("user", other)?;

        let mut wanted = vec![uid.clone(), other.to_string()];
        wanted.sort();

        let query = Query::collection(CHATS)
            .filter(Filter::ArrayContains("participants".to_string(), json!(uid)));
        for doc in self.session.store().query(&query).await? {
            let conversation = Conversation::from_document(&doc)?;
            if conversation.participants == wanted {
                return Ok(Some(conversation));
            }
        }
        Ok(None)
    }

    /// Identities whose email starts with `term`, not counting the caller.
    pub async fn search_users(&self, term: &str) -> Result<Vec<Identity>> {
        let uid = self.session.require_uid()?;
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::collection(USERS)
            .filter(Filter::StartsWith("email".to_string(), term.clone()))
            .order_by("email", Direction::Asc, TieBreak::Created)
            .limit(SEARCH_LIMIT + 1);
        let mut found = Vec::new();
        for doc in self.session.store().query(&query).await? {
            let identity = Identity::from_document(&doc)?;
            if identity.uid != uid {
                found.push(identity);
            }
        }
        found.truncate(SEARCH_LIMIT);
        debug!("Search for {:?} matched {} users", term, found.len());
        Ok(found)
    }

    /// One conversation, if the caller takes part in it.
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let uid = self.session.require_uid()?;
        require_participant(self.session.store().as_ref(), conversation_id, &uid).await
    }

    /// Stored profiles for the given ids, skipping ids with no record.
    pub async fn profiles(&self, uids: &[String]) -> Result<Vec<Identity>> {
        let store = self.session.store();
        let mut profiles = Vec::with_capacity(uids.len());
        for uid in uids {
            validate_id("user", uid)?;
            match store.get(&DocPath::new(USERS, uid)).await? {
                Some(doc) => profiles.push(Identity::from_document(&doc)?),
                None => debug!("No profile stored for {}", uid),
            }
        }
        Ok(profiles)
    }
}
