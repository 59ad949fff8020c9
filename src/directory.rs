use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::model::UserProfile;

/// User lookup collaborator. Profile CRUD lives outside this crate; the
/// chat core only ever resolves emails and reads profiles.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_by_email(&self, email: &str) -> Result<Option<String>, ChatError>;
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, ChatError>;
}

/// In-memory directory used by tests and the dev binary. Emails are
/// matched case-insensitively.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: RwLock<DirectoryState>,
}

#[derive(Default)]
struct DirectoryState {
    by_email: HashMap<String, String>,
    profiles: HashMap<String, UserProfile>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        MemoryDirectory::default()
    }

    pub async fn register(&self, profile: UserProfile) {
        let mut state = self.inner.write().await;
        state
            .by_email
            .insert(profile.email.to_lowercase(), profile.id.clone());
        state.profiles.insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn resolve_by_email(&self, email: &str) -> Result<Option<String>, ChatError> {
        let state = self.inner.read().await;
        Ok(state.by_email.get(&email.to_lowercase()).cloned())
    }

    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, ChatError> {
        let state = self.inner.read().await;
        Ok(state.profiles.get(user_id).cloned())
    }
}
