//! Signed-in identity, profile provisioning and the sign-out cascade.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::subscription::{spawn_live, Projection, Subscription, SubscriptionRegistry};
use super::{validate_id, USERS};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::{ChatError, Result, StoreError};
use crate::models::Identity;
use crate::store::{to_fields, AuthProvider, AuthUser, DocPath, Patch, Query, Store, WriteBatch};

/// Platform tag written to new profiles.
pub fn platform_tag() -> &'static str {
    if cfg!(any(target_os = "android", target_os = "ios")) {
        "mobile"
    } else {
        "desktop"
    }
}

pub struct Session {
    store: Arc<dyn Store>,
    auth: Arc<dyn AuthProvider>,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    identity: RwLock<Option<Identity>>,
    loading: AtomicBool,
    subscriptions: SubscriptionRegistry,
}

impl Session {
    pub fn new(
        store: Arc<dyn Store>,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Session {
            store,
            auth,
            clock,
            config,
            identity: RwLock::new(None),
            // Nothing is known until the first bootstrap finishes
            loading: AtomicBool::new(true),
            subscriptions: SubscriptionRegistry::default(),
        })
    }

    /// Resolve the signed-in account into an identity record, provisioning a
    /// default profile the first time the account is seen.
    pub async fn bootstrap(&self) -> Result<Option<Identity>> {
        self.loading.store(true, Ordering::SeqCst);
        let result = self.resolve_identity().await;
        self.loading.store(false, Ordering::SeqCst);
        result
    }

    async fn resolve_identity(&self) -> Result<Option<Identity>> {
        let user = match self.auth.current_user().await? {
            Some(user) => user,
            None => {
                info!("No account signed in");
                self.set_identity(None);
                return Ok(None);
            }
        };
        validate_id("user", &user.uid)?;

        let path = DocPath::new(USERS, &user.uid);
        let mut identity = match self.store.get(&path).await? {
            Some(doc) => {
                debug!("Loaded existing profile for {}", user.uid);
                Identity::from_document(&doc)?
            }
            None => self.provision(&user, &path).await?,
        };

        let now = self.clock.now();
        let online = Patch::new()
            .set("onlineStatus", true)
            .set("status", "online")
            .set("lastSeen", now.timestamp_millis());
        match self.store.update(&path, online).await {
            Ok(()) => {
                identity.online_status = true;
                identity.status = "online".to_string();
                identity.last_seen = now;
            }
            Err(e) => warn!("Could not mark {} online: {}", user.uid, e),
        }

        info!("Session ready for {} ({})", identity.uid, identity.display_name);
        self.set_identity(Some(identity.clone()));
        Ok(Some(identity))
    }

    async fn provision(&self, user: &AuthUser, path: &DocPath) -> Result<Identity> {
        let identity = Identity::provisional(user, platform_tag(), self.clock.now());
        let data = to_fields(path, &identity)?;

        match self.store.commit(WriteBatch::new().create(path.clone(), data)).await {
            Ok(_) => {
                info!("Provisioned profile for {}", user.uid);
                Ok(identity)
            }
            Err(StoreError::AlreadyExists(_)) => {
                // Another client won the race; its record stands
                debug!("Profile for {} was provisioned concurrently", user.uid);
                let doc = self
                    .store
                    .get(path)
                    .await?
                    .ok_or_else(|| ChatError::NotFound(path.to_string()))?;
                Ok(Identity::from_document(&doc)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark presence offline, cancel every live subscription and sign out of
    /// the provider.
    pub async fn sign_out(&self) -> Result<()> {
        if let Some(identity) = self.current() {
            let offline = Patch::new()
                .set("onlineStatus", false)
                .set("status", "offline")
                .set("lastSeen", self.clock.now().timestamp_millis());
            if let Err(e) = self.store.update(&DocPath::new(USERS, &identity.uid), offline).await {
                warn!("Could not mark {} offline: {}", identity.uid, e);
            }
        }

        let cancelled = self.subscriptions.cancel_all();
        info!("Signing out, cancelled {} subscriptions", cancelled);
        self.set_identity(None);
        self.auth.sign_out().await?;
        Ok(())
    }

    /// Open a live query whose lifetime is bound to this session.
    pub fn live<P: Projection>(&self, query: Query, projection: P, label: &str) -> Subscription<P::Output> {
        let subscription = spawn_live(
            self.store.clone(),
            query,
            projection,
            self.config.live_options(),
            label,
        );
        self.subscriptions.register(subscription.cancel_handle());
        subscription
    }

    pub fn current(&self) -> Option<Identity> {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn require_identity(&self) -> Result<Identity> {
        self.current()
            .ok_or_else(|| ChatError::Unauthorized("no identity signed in".to_string()))
    }

    pub fn require_uid(&self) -> Result<String> {
        self.require_identity().map(|identity| identity.uid)
    }

    pub(crate) fn set_identity(&self, identity: Option<Identity>) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }

    /// Replace the cached identity after a profile write, unless the session
    /// has moved on to another account (or signed out) meanwhile.
    pub(crate) fn refresh_identity(&self, identity: Identity) {
        let mut current = self.identity.write().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().map_or(false, |c| c.uid == identity.uid) {
            *current = Some(identity);
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
