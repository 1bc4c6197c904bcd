//! Short-lived media statuses, visible for a fixed window after posting.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::session::Session;
use super::subscription::{Projection, Subscription};
use super::{validate_id, STATUS};
use crate::clock::Clock;
use crate::error::{ChatError, Result, StoreError};
use crate::models::{StatusMediaType, StatusUpdate};
use crate::store::{to_fields, DocPath, Direction, Document, Filter, Patch, Query, TieBreak, WriteBatch};

// Expired statuses drop out of a live board this often
const EXPIRY_CHECK: Duration = Duration::from_secs(60);

/// Live statuses split into the viewer's own and everyone else's, newest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusBoard {
    pub mine: Vec<StatusUpdate>,
    pub others: Vec<StatusUpdate>,
}

impl StatusBoard {
    fn build(docs: &[Document], viewer: &str, cutoff: DateTime<Utc>) -> Self {
        let mut board = StatusBoard::default();
        for doc in docs {
            let status = match StatusUpdate::from_document(doc) {
                Ok(status) => status,
                Err(e) => {
                    warn!("Skipping unreadable status: {}", e);
                    continue;
                }
            };
            if status.timestamp <= cutoff {
                continue;
            }
            if status.user_id == viewer {
                board.mine.push(status);
            } else {
                board.others.push(status);
            }
        }
        board
    }

    /// Statuses from others the viewer has not opened yet.
    pub fn unviewed(&self, viewer: &str) -> Vec<&StatusUpdate> {
        self.others
            .iter()
            .filter(|s| !s.viewers.iter().any(|v| v == viewer))
            .collect()
    }
}

struct BoardProjection {
    viewer: String,
    clock: Arc<dyn Clock>,
    window: ChronoDuration,
    last: Option<StatusBoard>,
}

impl Projection for BoardProjection {
    type Output = StatusBoard;

    fn project(&mut self, docs: &[Document]) -> std::result::Result<Option<StatusBoard>, StoreError> {
        let board = StatusBoard::build(docs, &self.viewer, self.clock.now() - self.window);
        if self.last.as_ref() == Some(&board) {
            return Ok(None);
        }
        self.last = Some(board.clone());
        Ok(Some(board))
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(EXPIRY_CHECK)
    }
}

pub struct StatusFeed {
    session: Arc<Session>,
}

impl StatusFeed {
    pub fn new(session: Arc<Session>) -> Self {
        StatusFeed { session }
    }

    /// Upload the media and publish it as the caller's status.
    pub async fn post(&self, bytes: Vec<u8>, media_type: StatusMediaType) -> Result<StatusUpdate> {
        let identity = self.session.require_identity()?;
        if bytes.is_empty() {
            return Err(ChatError::InvalidArgument("status media is empty".to_string()));
        }

        let store = self.session.store();
        let now = self.session.clock().now();
        let id = Uuid::new_v4().to_string();
        let blob_path = format!("{}/{}/{}", STATUS, identity.uid, id);
        let media_url = store.upload_blob(&blob_path, bytes).await?;

        let status = StatusUpdate {
            id,
            user_id: identity.uid.clone(),
            user_name: identity.display_name.clone(),
            user_photo: identity.profile_picture.clone(),
            media_url,
            media_type,
            timestamp: now,
            viewers: Vec::new(),
        };
        let path = DocPath::new(STATUS, &status.id);
        store
            .commit(WriteBatch::new().create(path.clone(), to_fields(&path, &status)?))
            .await?;

        info!("{} posted status {}", identity.uid, status.id);
        Ok(status)
    }

    /// Live board of statuses younger than the configured window.
    pub fn subscribe(&self) -> Result<Subscription<StatusBoard>> {
        let uid = self.session.require_uid()?;
        let clock = self.session.clock().clone();
        let window = self.session.config().status_window();
        let cutoff = clock.now() - window;

        let query = Query::collection(STATUS)
            .filter(Filter::Gt("timestamp".to_string(), json!(cutoff.timestamp_millis())))
            .order_by("timestamp", Direction::Desc, TieBreak::Created);
        let projection = BoardProjection {
            viewer: uid.clone(),
            clock,
            window,
            last: None,
        };
        Ok(self.session.live(query, projection, &format!("status:{}", uid)))
    }

    /// Record that the caller opened someone else's status. Returns whether
    /// the viewer list changed.
    pub async fn mark_viewed(&self, status_id: &str) -> Result<bool> {
        let uid = self.session.require_uid()?;
        validate_id("status", status_id)?;

        let store = self.session.store();
        let path = DocPath::new(STATUS, status_id);
        let doc = store
            .get(&path)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("status {}", status_id)))?;
        let status = StatusUpdate::from_document(&doc)?;

        if status.user_id == uid || status.viewers.iter().any(|v| *v == uid) {
            return Ok(false);
        }
        store
            .update(&path, Patch::new().array_union("viewers", vec![json!(uid)]))
            .await?;
        debug!("{} viewed status {}", uid, status_id);
        Ok(true)
    }
}
