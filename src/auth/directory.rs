use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Authoritative lookup of a subject's current roles.
///
/// Returning `Ok(None)` means the subject no longer exists; the request is
/// then rejected as unauthenticated. Returned roles replace the roles carried
/// in the credential so that revocations take effect before tokens expire.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn roles_for(&self, subject: &str) -> anyhow::Result<Option<BTreeSet<String>>>;
}

/// In-process directory backed by a map.
#[derive(Debug, Default)]
pub struct StaticUserDirectory {
    users: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, subject: &str, roles: &[&str]) {
        let roles = roles.iter().map(|r| (*r).to_string()).collect();
        self.users.write().await.insert(subject.to_string(), roles);
    }

    pub async fn remove(&self, subject: &str) {
        self.users.write().await.remove(subject);
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn roles_for(&self, subject: &str) -> anyhow::Result<Option<BTreeSet<String>>> {
        Ok(self.users.read().await.get(subject).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_subject_is_none() {
        let directory = StaticUserDirectory::new();
        assert!(directory.roles_for("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_revokes_subject() {
        let directory = StaticUserDirectory::new();
        directory.upsert("alice", &["admin"]).await;
        assert!(directory.roles_for("alice").await.unwrap().unwrap().contains("admin"));

        directory.remove("alice").await;
        assert!(directory.roles_for("alice").await.unwrap().is_none());
    }
}
