//! Typing indicators. A raised flag older than the liveness window reads as
//! false.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use super::session::Session;
use super::subscription::{Projection, Subscription};
use super::{require_participant, typing_collection};
use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::models::TypingState;
use crate::store::{to_fields, DocPath, Document, Query};

/// The sorted ids of participants other than `viewer` with a live flag.
fn live_typists(docs: &[Document], viewer: &str, now: DateTime<Utc>, window: ChronoDuration) -> Vec<String> {
    let mut typing: Vec<String> = docs
        .iter()
        .filter_map(|doc| match TypingState::from_document(doc) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Skipping unreadable typing flag: {}", e);
                None
            }
        })
        .filter(|state| state.identity_id != viewer && state.is_live(now, window))
        .map(|state| state.identity_id)
        .collect();
    typing.sort();
    typing
}

struct TypingProjection {
    viewer: String,
    clock: Arc<dyn Clock>,
    window: ChronoDuration,
    refresh: Duration,
    last: Option<Vec<String>>,
}

impl Projection for TypingProjection {
    type Output = Vec<String>;

    fn project(&mut self, docs: &[Document]) -> std::result::Result<Option<Vec<String>>, StoreError> {
        let typing = live_typists(docs, &self.viewer, self.clock.now(), self.window);
        if self.last.as_ref() == Some(&typing) {
            return Ok(None);
        }
        self.last = Some(typing.clone());
        Ok(Some(typing))
    }

    // Flags expire without a store write, so look again periodically
    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.refresh)
    }
}

pub struct TypingSignal {
    session: Arc<Session>,
}

impl TypingSignal {
    pub fn new(session: Arc<Session>) -> Self {
        TypingSignal { session }
    }

    /// Raise or clear the caller's flag in a conversation.
    pub async fn set_typing(&self, conversation_id: &str, is_typing: bool) -> Result<()> {
        let uid = self.session.require_uid()?;
        let store = self.session.store();
        require_participant(store.as_ref(), conversation_id, &uid).await?;

        let state = TypingState {
            identity_id: uid.clone(),
            is_typing,
            updated_at: self.session.clock().now(),
        };
        let path = DocPath::new(&typing_collection(conversation_id), &uid);
        store.put(&path, to_fields(&path, &state)?).await?;
        debug!("{} typing={} in {}", uid, is_typing, conversation_id);
        Ok(())
    }

    /// Live set of the other participants currently typing.
    pub async fn subscribe(&self, conversation_id: &str) -> Result<Subscription<Vec<String>>> {
        let uid = self.session.require_uid()?;
        require_participant(self.session.store().as_ref(), conversation_id, &uid).await?;

        let config = self.session.config();
        let projection = TypingProjection {
            viewer: uid,
            clock: self.session.clock().clone(),
            window: config.typing_liveness(),
            refresh: config.typing_refresh(),
            last: None,
        };
        let label = format!("typing:{}", conversation_id);
        Ok(self
            .session
            .live(Query::collection(&typing_collection(conversation_id)), projection, &label))
    }

    /// One-shot read of who is typing right now.
    pub async fn typing_now(&self, conversation_id: &str) -> Result<Vec<String>> {
        let uid = self.session.require_uid()?;
        let store = self.session.store();
        require_participant(store.as_ref(), conversation_id, &uid).await?;

        let docs = store.query(&Query::collection(&typing_collection(conversation_id))).await?;
        Ok(live_typists(
            &docs,
            &uid,
            self.session.clock().now(),
            self.session.config().typing_liveness(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Fields;

    fn flag(uid: &str, is_typing: bool, at: DateTime<Utc>) -> Document {
        let path = DocPath::new("chats/c1/typing", uid);
        let state = TypingState {
            identity_id: uid.to_string(),
            is_typing,
            updated_at: at,
        };
        Document {
            data: to_fields(&path, &state).unwrap_or_else(|_| Fields::new()),
            path,
            created_seq: 1,
            updated_seq: 1,
        }
    }

    #[test]
    fn test_stale_and_own_flags_are_ignored() {
        let now = Utc::now();
        let docs = vec![
            flag("bob", true, now - ChronoDuration::seconds(2)),
            flag("carol", true, now - ChronoDuration::seconds(30)),
            flag("dave", false, now),
            flag("amy", true, now),
        ];
        let typing = live_typists(&docs, "amy", now, ChronoDuration::seconds(8));
        assert_eq!(typing, vec!["bob".to_string()]);
    }
}
