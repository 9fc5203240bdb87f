//! Share Token Service (§4.8): time-limited, optionally provider-scoped
//! download links.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BackupError, Result};
use crate::model::ShareToken;
use crate::repository::Repository;

const MIN_TTL_HOURS: u32 = 1;
const MAX_TTL_HOURS: u32 = 168;
const DEFAULT_TTL_HOURS: u32 = 24;

pub struct ShareTokenService {
    repository: Arc<Repository>,
}

/// Result of issuing a share link.
pub struct CreatedShare {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl ShareTokenService {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository }
    }

    /// Issue a share token for `backup_id`, optionally scoped to one
    /// provider. `ttl_hours` is clamped to `[1, 168]`; `None` defaults to
    /// 24. The token is 256 bits of entropy (two concatenated 128-bit
    /// random values) rendered as hex.
    pub async fn create_share(&self, backup_id: Uuid, provider_id: Option<Uuid>, ttl_hours: Option<u32>) -> Result<CreatedShare> {
        let ttl_hours = ttl_hours.unwrap_or(DEFAULT_TTL_HOURS).clamp(MIN_TTL_HOURS, MAX_TTL_HOURS);
        let now = Utc::now();
        let expires_at = now + ChronoDuration::hours(ttl_hours as i64);
        let token = generate_token();

        self.repository
            .create_share_token(ShareToken {
                token: token.clone(),
                backup_id,
                provider_id,
                created_at: now,
                expires_at,
                access_count: 0,
            })
            .await?;

        Ok(CreatedShare { token, expires_at })
    }

    /// Resolve a token to `(backup_id, provider_id)`, checking expiry and
    /// atomically incrementing `access_count`. Unknown or expired tokens
    /// fail with `ShareInvalid`.
    pub async fn resolve_share(&self, token: &str) -> Result<(Uuid, Option<Uuid>)> {
        let share = self.repository.get_share_token(token).await?.ok_or(BackupError::ShareInvalid)?;

        if Utc::now() > share.expires_at {
            return Err(BackupError::ShareInvalid);
        }

        self.repository.increment_share_access(token).await?;
        Ok((share.backup_id, share.provider_id))
    }
}

fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_share_clamps_ttl_to_bounds() {
        let repo = Arc::new(Repository::open(std::path::Path::new(":memory:")).await.unwrap());
        let service = ShareTokenService::new(repo);
        let backup_id = Uuid::new_v4();

        let share = service.create_share(backup_id, None, Some(10_000)).await.unwrap();
        let hours = (share.expires_at - Utc::now()).num_hours();
        assert!(hours <= MAX_TTL_HOURS as i64 && hours > (MAX_TTL_HOURS as i64 - 2));
    }

    #[tokio::test]
    async fn resolve_share_rejects_unknown_token() {
        let repo = Arc::new(Repository::open(std::path::Path::new(":memory:")).await.unwrap());
        let service = ShareTokenService::new(repo);
        let err = service.resolve_share("does-not-exist").await.unwrap_err();
        assert!(matches!(err, BackupError::ShareInvalid));
    }

    #[tokio::test]
    async fn resolve_share_rejects_expired_token() {
        let repo = Arc::new(Repository::open(std::path::Path::new(":memory:")).await.unwrap());
        let backup_id = Uuid::new_v4();
        repo.create_share_token(ShareToken {
            token: "expired-token".to_string(),
            backup_id,
            provider_id: None,
            created_at: Utc::now() - ChronoDuration::hours(3),
            expires_at: Utc::now() - ChronoDuration::hours(1),
            access_count: 0,
        })
        .await
        .unwrap();

        let service = ShareTokenService::new(repo);
        let err = service.resolve_share("expired-token").await.unwrap_err();
        assert!(matches!(err, BackupError::ShareInvalid));
    }

    #[tokio::test]
    async fn resolve_share_increments_access_count() {
        let repo = Arc::new(Repository::open(std::path::Path::new(":memory:")).await.unwrap());
        let backup_id = Uuid::new_v4();
        let service = ShareTokenService::new(repo.clone());
        let share = service.create_share(backup_id, None, None).await.unwrap();

        service.resolve_share(&share.token).await.unwrap();
        service.resolve_share(&share.token).await.unwrap();

        let stored = repo.get_share_token(&share.token).await.unwrap().unwrap();
        assert_eq!(stored.access_count, 2);
    }
}
