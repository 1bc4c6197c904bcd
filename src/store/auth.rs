//! Boundary to the external authentication provider.

use async_trait::async_trait;
use log::info;
use std::sync::Mutex;

use crate::error::StoreError;

/// What the auth provider knows about a signed-in account
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl AuthUser {
    pub fn new(uid: &str, email: &str) -> Self {
        AuthUser {
            uid: uid.to_string(),
            email: email.to_string(),
            display_name: None,
            photo_url: None,
        }
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The account currently signed in with the provider, if any.
    async fn current_user(&self) -> Result<Option<AuthUser>, StoreError>;

    async fn sign_out(&self) -> Result<(), StoreError>;
}

/// Provider whose account is set directly. Stands in for the hosted sign-in
/// flow in tests and in the CLI.
#[derive(Debug, Default)]
pub struct StaticAuth {
    user: Mutex<Option<AuthUser>>,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user: AuthUser) -> Self {
        StaticAuth {
            user: Mutex::new(Some(user)),
        }
    }

    pub fn sign_in(&self, user: AuthUser) {
        info!("Auth provider signed in {}", user.uid);
        *self.user.lock().unwrap_or_else(|e| e.into_inner()) = Some(user);
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_user(&self) -> Result<Option<AuthUser>, StoreError> {
        Ok(self.user.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn sign_out(&self) -> Result<(), StoreError> {
        self.user.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}
