//! Opaque capabilities the coordinator depends on but does not own:
//! connection lookup, settings/secret decryption, and fire-and-forget
//! event notification. The embedding application supplies implementations;
//! this crate never talks to a user database or a notification transport
//! directly.

use async_trait::async_trait;
use uuid::Uuid;

use crate::dump::ConnectionInfo;
use crate::error::Result;
use crate::model::S3Provider;

/// A backup lifecycle event worth notifying someone about.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Started { backup_id: Uuid, connection_id: Uuid },
    Success { backup_id: Uuid, connection_id: Uuid },
    /// Routes identically to `Success` but with a distinct variant so a
    /// notifier can choose a different subject line / severity.
    CompletedWithErrors { backup_id: Uuid, connection_id: Uuid, error_count: usize },
    Failed { backup_id: Uuid, connection_id: Uuid, reason: String },
}

/// Fire-and-forget delivery of backup lifecycle events. Implementations
/// must not let a slow or failing transport block the coordinator; errors
/// are logged by the implementation, not propagated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: BackupEvent);
}

/// A no-op notifier, used where no transport is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _event: BackupEvent) {}
}

/// Resolves connection records owned by the embedding application into
/// the dump driver's [`ConnectionInfo`] shape.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn get_connection(&self, connection_id: Uuid) -> Result<ConnectionInfo>;
}

/// Resolves provider records and decrypts their stored secret key.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn get_provider(&self, provider_id: Uuid) -> Result<S3Provider>;
    async fn get_default_provider(&self, connection_id: Uuid) -> Result<S3Provider>;
    /// Every provider configured for the owner of `connection_id`, used
    /// to resolve an unspecified sink list (§4.6 step 2).
    async fn list_providers(&self, connection_id: Uuid) -> Result<Vec<S3Provider>>;
    /// Decrypt a provider's ciphertext secret key into plaintext for use
    /// in a single connect call. The core never persists the result.
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<String>;
}
