// Common test utilities for integration tests
// Every test file pulls in only what it needs
#![allow(dead_code)]

use std::sync::{Arc, Once};

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{info, LevelFilter};
use tokio::time::{timeout, Duration as TokioDuration};

use xchat::clock::ManualClock;
use xchat::config::ClientConfig;
use xchat::store::{AuthUser, MemoryStore, StaticAuth};
use xchat::sync::{ChatDirectory, Session, Subscription, SyncEvent};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Defaults with short timers so expiry and reconnects happen within a test
pub fn test_config() -> ClientConfig {
    ClientConfig {
        typing_refresh_ms: 20,
        resubscribe_base_ms: 10,
        resubscribe_max_ms: 50,
        ..ClientConfig::default()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

/// One shared store and clock that several signed-in sessions talk to
pub struct World {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl World {
    pub fn new() -> Self {
        setup_logging();
        World {
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::new(start_time())),
        }
    }

    /// Sign `uid` in and bootstrap its session.
    pub async fn session(&self, uid: &str) -> Result<Arc<Session>> {
        let session = self.signed_in(uid);
        session
            .bootstrap()
            .await?
            .ok_or_else(|| anyhow!("no identity for {}", uid))?;
        info!("Test session ready for {}", uid);
        Ok(session)
    }

    /// A session for `uid` that has not bootstrapped yet.
    pub fn signed_in(&self, uid: &str) -> Arc<Session> {
        let user = AuthUser::new(uid, &format!("{}@example.com", uid));
        Session::new(
            self.store.clone(),
            Arc::new(StaticAuth::signed_in(user)),
            self.clock.clone(),
            test_config(),
        )
    }

    /// Conversation between `owner` and `others`, created by `owner`.
    pub async fn conversation(&self, owner: &Arc<Session>, others: &[&str]) -> Result<String> {
        Ok(ChatDirectory::new(owner.clone()).create_conversation(others).await?)
    }
}

/// Wait for the first snapshot matching `predicate`, skipping the others.
pub async fn wait_for<T>(
    subscription: &mut Subscription<T>,
    predicate: impl Fn(&T) -> bool,
) -> Result<T> {
    match timeout(TokioDuration::from_secs(2), async {
        while let Some(event) = subscription.next().await {
            if let SyncEvent::Snapshot(value) = event {
                if predicate(&value) {
                    return Ok(value);
                }
            }
        }
        Err(anyhow!("Subscription ended"))
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow!("Timed out waiting for snapshot")),
    }
}

/// The next event of any kind, failing on timeout.
pub async fn next_event<T>(subscription: &mut Subscription<T>) -> Result<Option<SyncEvent<T>>> {
    timeout(TokioDuration::from_secs(2), subscription.next())
        .await
        .map_err(|_| anyhow!("Timed out waiting for event"))
}
