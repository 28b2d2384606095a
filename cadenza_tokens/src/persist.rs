//! Persisting authorizations to the local filesystem
//!
//! A persisted authorization lets an application resume with the same
//! credentials after a restart instead of sending the user through the
//! authorization flow again.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::{fs::OpenOptions, task::JoinHandle};

use crate::{AuthorizationManager, ChangeKind, CredentialState, PersistedAuthorization};

/// An error reading or writing a credential file
#[derive(Debug, Error)]
pub enum StoreError {
    /// The credential file could not be accessed
    #[error("credential file could not be accessed")]
    Io(#[from] io::Error),

    /// The credential file does not hold a persisted authorization
    #[error("credential file is malformed")]
    Malformed(#[from] serde_json::Error),
}

/// Stores a persisted authorization in a local file
///
/// On Unix, the file is created readable only by its owner.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Constructs a new store backed by the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored authorization
    ///
    /// Returns `None` if nothing has been stored yet.
    pub async fn load(&self) -> Result<Option<PersistedAuthorization>, StoreError> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Stores `authorization`, replacing whatever was stored before
    pub async fn save(&self, authorization: &PersistedAuthorization) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let data = serde_json::to_string_pretty(authorization)?;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Removes the stored authorization, if any
    pub async fn remove(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps `store` in step with the credentials held by `manager`
///
/// The authorization is saved whenever credentials are authorized or
/// refreshed and removed when the manager is deauthorized. Each save writes
/// the credentials carried by the change itself, so a later change never
/// leaks into an earlier save. The task ends once the manager has been dropped
/// and every change announced before then has been handled.
pub fn spawn_persistence<M>(manager: &Arc<M>, store: FileCredentialStore) -> JoinHandle<()>
where
    M: AuthorizationManager + 'static,
{
    let mut subscription = manager.subscribe();
    let identity = manager.to_persisted();

    tokio::spawn(async move {
        while let Some(change) = subscription.recv().await {
            let result = match change.kind() {
                ChangeKind::Deauthorized => store.remove().await,
                ChangeKind::Authorized | ChangeKind::Refreshed => {
                    let persisted = PersistedAuthorization {
                        client_id: identity.client_id.clone(),
                        client_secret: identity.client_secret.clone(),
                        credentials: CredentialState::clone(change.credentials()),
                    };
                    store.save(&persisted).await
                }
            };

            match result {
                Ok(()) => tracing::debug!(
                    kind = ?change.kind(),
                    sequence = change.sequence(),
                    path = %store.path().display(),
                    "persisted credential change"
                ),
                Err(error) => tracing::warn!(
                    kind = ?change.kind(),
                    sequence = change.sequence(),
                    path = %store.path().display(),
                    error = &error as &dyn std::error::Error,
                    "unable to persist credential change"
                ),
            }
        }

        tracing::trace!(path = %store.path().display(), "credential persistence stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use cadenza_clock::{Clock, TestClock};
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::{
        test_support::MockTransport, AccessToken, ClientId, PkceManager, RefreshToken, Scopes,
        State,
    };

    fn temp_store() -> FileCredentialStore {
        FileCredentialStore::new(
            std::env::temp_dir().join(format!("cadenza-credentials-{}.json", State::random())),
        )
    }

    fn example_authorization() -> PersistedAuthorization {
        PersistedAuthorization {
            client_id: ClientId::from_static("client"),
            client_secret: None,
            credentials: CredentialState::new(
                AccessToken::from_static("AT1"),
                Some(RefreshToken::from_static("RT1")),
                Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
                Scopes::single("user-read-email"),
            ),
        }
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("condition was never met");
    }

    #[tokio::test]
    async fn loading_a_missing_file_yields_nothing() {
        let store = temp_store();

        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn saved_authorizations_can_be_loaded() {
        let store = temp_store();
        let authorization = example_authorization();

        store.save(&authorization).await.unwrap();
        let loaded = store.load().await.unwrap();
        store.remove().await.unwrap();

        assert_eq!(loaded, Some(authorization));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_readable_only_by_their_owner() {
        use std::os::unix::fs::PermissionsExt;

        let store = temp_store();
        store.save(&example_authorization()).await.unwrap();

        let mode = tokio::fs::metadata(store.path())
            .await
            .unwrap()
            .permissions()
            .mode();
        store.remove().await.unwrap();

        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn malformed_files_are_reported() {
        let store = temp_store();
        tokio::fs::write(store.path(), b"not json").await.unwrap();

        let err = store.load().await.unwrap_err();
        store.remove().await.unwrap();

        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[tokio::test]
    async fn removing_a_missing_file_succeeds() {
        temp_store().remove().await.unwrap();
    }

    fn expired_manager(transport: MockTransport) -> Arc<PkceManager> {
        let clock = TestClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let credentials = CredentialState::new(
            AccessToken::from_static("AT1"),
            Some(RefreshToken::from_static("RT1")),
            clock.now() - Duration::minutes(1),
            Scopes::single("user-read-email"),
        );
        Arc::new(
            PkceManager::new(ClientId::from_static("client"), Arc::new(transport))
                .with_clock(clock)
                .with_credentials(credentials),
        )
    }

    #[tokio::test]
    async fn persistence_follows_manager_changes() {
        let store = temp_store();
        let transport = MockTransport::new();
        transport.push_token("AT2", Some("RT2"), "user-read-email");
        let manager = expired_manager(transport);

        let task = spawn_persistence(&manager, store.clone());
        let store = &store;

        manager.refresh(false, Duration::zero()).await.unwrap();
        wait_for(|| async move {
            matches!(
                store.load().await,
                Ok(Some(ref persisted))
                    if persisted.credentials.access_token().map(|t| t.as_str()) == Some("AT2")
            )
        })
        .await;

        manager.deauthorize();
        wait_for(|| async move { matches!(store.load().await, Ok(None)) }).await;

        drop(manager);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn announced_credentials_are_saved_after_the_manager_is_dropped() {
        let store = temp_store();
        let transport = MockTransport::new();
        transport.push_token("AT2", Some("RT2"), "user-read-email");
        let manager = expired_manager(transport);

        let task = spawn_persistence(&manager, store.clone());
        let refreshed = manager.refresh(false, Duration::zero()).await.unwrap();
        drop(manager);
        task.await.unwrap();

        let persisted = store.load().await.unwrap().unwrap();
        store.remove().await.unwrap();

        assert_eq!(persisted.client_id.as_str(), "client");
        assert_eq!(persisted.client_secret, None);
        assert_eq!(persisted.credentials, *refreshed);
    }
}
