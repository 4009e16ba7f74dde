use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use trellis_store::NodeError;

/// Why a credential could not be handed to a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
  #[error("access to credential '{credential_id}' denied")]
  Denied { credential_id: String },

  #[error("credential '{credential_id}' not found")]
  NotFound { credential_id: String },

  #[error("credential '{credential_id}' has expired")]
  Expired { credential_id: String },

  /// The node asked for a slot its definition does not bind.
  #[error("no credential bound to slot '{slot}'")]
  UnboundSlot { slot: String },
}

impl From<CredentialError> for NodeError {
  fn from(e: CredentialError) -> Self {
    NodeError::configuration(e.to_string())
  }
}

/// A decrypted credential.
#[derive(Clone, PartialEq)]
pub struct Credential {
  pub credential_id: String,
  pub data: serde_json::Value,
  pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
  pub fn new(credential_id: impl Into<String>, data: serde_json::Value) -> Self {
    Self {
      credential_id: credential_id.into(),
      data,
      expires_at: None,
    }
  }

  pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
    self.expires_at = Some(at);
    self
  }
}

impl std::fmt::Debug for Credential {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Credential")
      .field("credential_id", &self.credential_id)
      .field("data", &"<redacted>")
      .field("expires_at", &self.expires_at)
      .finish()
  }
}

/// Source of credentials, resolved on behalf of a user.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
  async fn resolve(&self, credential_id: &str, user_id: Option<&str>) -> Result<Credential, CredentialError>;
}

struct Entry {
  credential: Credential,
  /// `None` means any user may use it.
  grants: Option<HashSet<String>>,
}

/// In-memory credentials with optional per-user grants.
#[derive(Default)]
pub struct StaticCredentials {
  entries: HashMap<String, Entry>,
}

impl StaticCredentials {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a credential usable by everyone.
  pub fn insert(&mut self, credential: Credential) {
    self.entries.insert(
      credential.credential_id.clone(),
      Entry {
        credential,
        grants: None,
      },
    );
  }

  /// Restrict a credential to the granted users, adding `user_id`.
  pub fn grant(&mut self, credential_id: &str, user_id: impl Into<String>) {
    if let Some(entry) = self.entries.get_mut(credential_id) {
      entry.grants.get_or_insert_with(HashSet::new).insert(user_id.into());
    }
  }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
  async fn resolve(&self, credential_id: &str, user_id: Option<&str>) -> Result<Credential, CredentialError> {
    let entry = self
      .entries
      .get(credential_id)
      .ok_or_else(|| CredentialError::NotFound {
        credential_id: credential_id.to_string(),
      })?;

    if let Some(grants) = &entry.grants {
      if !user_id.is_some_and(|u| grants.contains(u)) {
        return Err(CredentialError::Denied {
          credential_id: credential_id.to_string(),
        });
      }
    }

    if entry.credential.expires_at.is_some_and(|at| at <= Utc::now()) {
      return Err(CredentialError::Expired {
        credential_id: credential_id.to_string(),
      });
    }

    Ok(entry.credential.clone())
  }
}
