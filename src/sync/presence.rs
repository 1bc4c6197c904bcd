//! Online flag, last-seen time and profile edits.

use log::{debug, info};
use serde_json::json;
use std::sync::Arc;

use super::session::Session;
use super::subscription::{Mapped, Subscription};
use super::{validate_id, USERS};
use crate::error::{ChatError, Result};
use crate::models::Identity;
use crate::store::{DocPath, Document, Filter, Patch, Query};

/// Profile fields to change; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub profile_picture: Option<String>,
    pub phone_number: Option<String>,
}

pub struct Presence {
    session: Arc<Session>,
}

impl Presence {
    pub fn new(session: Arc<Session>) -> Self {
        Presence { session }
    }

    pub async fn go_online(&self) -> Result<()> {
        self.set_online(true).await
    }

    pub async fn go_offline(&self) -> Result<()> {
        self.set_online(false).await
    }

    async fn set_online(&self, online: bool) -> Result<()> {
        let mut identity = self.session.require_identity()?;
        let now = self.session.clock().now();
        let status = if online { "online" } else { "offline" };

        let patch = Patch::new()
            .set("onlineStatus", online)
            .set("status", status)
            .set("lastSeen", now.timestamp_millis());
        self.session
            .store()
            .update(&DocPath::new(USERS, &identity.uid), patch)
            .await?;

        debug!("{} is now {}", identity.uid, status);
        identity.online_status = online;
        identity.status = status.to_string();
        identity.last_seen = now;
        self.session.refresh_identity(identity);
        Ok(())
    }

    /// Apply a profile edit and return the updated identity.
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<Identity> {
        let mut identity = self.session.require_identity()?;
        let mut patch = Patch::new();

        if let Some(name) = update.display_name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ChatError::InvalidArgument("display name is empty".to_string()));
            }
            patch = patch.set("displayName", name);
            identity.display_name = name.to_string();
        }
        if let Some(bio) = update.bio {
            let bio = bio.trim().to_string();
            patch = patch.set("bio", bio.clone());
            identity.bio = bio;
        }
        if let Some(picture) = update.profile_picture {
            patch = patch.set("profilePicture", picture.clone());
            identity.profile_picture = picture;
        }
        if let Some(phone) = update.phone_number {
            let phone = phone.trim().to_string();
            if phone != identity.phone_number {
                // A new number has to be verified again
                patch = patch.set("phoneNumber", phone.clone()).set("isPhoneVerified", false);
                identity.phone_number = phone;
                identity.is_phone_verified = false;
            }
        }

        if patch.is_empty() {
            return Ok(identity);
        }
        self.session
            .store()
            .update(&DocPath::new(USERS, &identity.uid), patch)
            .await?;

        info!("Updated profile of {}", identity.uid);
        self.session.refresh_identity(identity.clone());
        Ok(identity)
    }

    pub async fn profile(&self, uid: &str) -> Result<Identity> {
        validate_id("user", uid)?;
        let doc = self
            .session
            .store()
            .get(&DocPath::new(USERS, uid))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("identity {}", uid)))?;
        Ok(Identity::from_document(&doc)?)
    }

    /// Live profile of another identity (online flag, last seen, edits).
    /// Emits `None` while no record exists.
    pub fn watch(&self, uid: &str) -> Result<Subscription<Option<Identity>>> {
        self.session.require_uid()?;
        validate_id("user", uid)?;

        let query = Query::collection(USERS).filter(Filter::Eq("uid".to_string(), json!(uid)));
        let decode = |docs: &[Document]| match docs.first() {
            Some(doc) => Identity::from_document(doc).map(Some),
            None => Ok(None),
        };
        Ok(self
            .session
            .live(query, Mapped::new(decode), &format!("presence:{}", uid)))
    }
}
