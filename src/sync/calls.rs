//! Call history. Calls themselves happen elsewhere; this only records how
//! they ended.

use log::{debug, info};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::session::Session;
use super::subscription::{Mapped, Subscription};
use super::{validate_id, CALLS, USERS};
use crate::error::{ChatError, Result, StoreError};
use crate::models::{CallOutcome, CallRecord, CallType};
use crate::store::{to_fields, DocPath, Direction, Document, Filter, Query, TieBreak, WriteBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// A call record as seen from one side
#[derive(Debug, Clone, PartialEq)]
pub struct CallEntry {
    pub record: CallRecord,
    pub direction: CallDirection,
}

impl CallEntry {
    /// The identity on the other end of the call.
    pub fn peer(&self) -> &str {
        match self.direction {
            CallDirection::Outgoing => &self.record.receiver_id,
            CallDirection::Incoming => &self.record.caller_id,
        }
    }
}

fn call_entries(docs: &[Document], viewer: &str) -> std::result::Result<Vec<CallEntry>, StoreError> {
    let mut entries = Vec::with_capacity(docs.len());
    for doc in docs {
        let record = CallRecord::from_document(doc)?;
        let direction = if record.caller_id == viewer {
            CallDirection::Outgoing
        } else if record.receiver_id == viewer {
            CallDirection::Incoming
        } else {
            continue;
        };
        entries.push(CallEntry { record, direction });
    }
    Ok(entries)
}

pub struct CallLog {
    session: Arc<Session>,
}

impl CallLog {
    pub fn new(session: Arc<Session>) -> Self {
        CallLog { session }
    }

    /// Record a finished call placed by the signed-in identity. The duration
    /// is kept only for answered calls.
    pub async fn record(
        &self,
        receiver_id: &str,
        call_type: CallType,
        outcome: CallOutcome,
        duration_secs: Option<u32>,
    ) -> Result<CallRecord> {
        let uid = self.session.require_uid()?;
        validate_id("user", receiver_id)?;
        if receiver_id == uid {
            return Err(ChatError::InvalidArgument("cannot call yourself".to_string()));
        }

        let store = self.session.store();
        if store.get(&DocPath::new(USERS, receiver_id)).await?.is_none() {
            return Err(ChatError::NotFound(format!("identity {}", receiver_id)));
        }

        let duration = match outcome {
            CallOutcome::Answered => duration_secs,
            _ => {
                if duration_secs.is_some() {
                    debug!("Ignoring duration of an unanswered call");
                }
                None
            }
        };
        let record = CallRecord {
            id: Uuid::new_v4().to_string(),
            caller_id: uid,
            receiver_id: receiver_id.to_string(),
            call_type,
            status: outcome,
            duration,
            timestamp: self.session.clock().now(),
        };
        let path = DocPath::new(CALLS, &record.id);
        store
            .commit(WriteBatch::new().create(path.clone(), to_fields(&path, &record)?))
            .await?;

        info!("Recorded {:?} call {} -> {}", record.status, record.caller_id, record.receiver_id);
        Ok(record)
    }

    /// Live call history of the signed-in identity, newest first.
    pub fn subscribe(&self) -> Result<Subscription<Vec<CallEntry>>> {
        let uid = self.session.require_uid()?;
        let query = Query::collection(CALLS)
            .filter(Filter::AnyOf(vec![
                Filter::Eq("callerId".to_string(), json!(uid)),
                Filter::Eq("receiverId".to_string(), json!(uid)),
            ]))
            .order_by("timestamp", Direction::Desc, TieBreak::Created);

        let label = format!("calls:{}", uid);
        let viewer = uid;
        let decode = move |docs: &[Document]| call_entries(docs, &viewer);
        Ok(self.session.live(query, Mapped::new(decode), &label))
    }
}
