//! Change notifications for authorization state

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::CredentialState;

const DEFAULT_CAPACITY: usize = 32;

/// The kind of change that was made to a manager's credentials
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Credentials were obtained through an authorization flow
    Authorized,
    /// The access token was refreshed
    Refreshed,
    /// The credentials were discarded
    Deauthorized,
}

/// A committed change to a manager's credentials
///
/// Changes from a single manager carry strictly increasing sequence numbers,
/// in the same order that the changes were committed.
#[derive(Clone, Debug)]
pub struct CredentialChange {
    kind: ChangeKind,
    sequence: u64,
    credentials: Arc<CredentialState>,
}

impl CredentialChange {
    /// The kind of change
    #[inline]
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// The position of this change in the manager's commit order
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The credentials as of this change
    #[inline]
    pub fn credentials(&self) -> &Arc<CredentialState> {
        &self.credentials
    }
}

/// Fans credential changes out to any number of subscribers
#[derive(Debug)]
pub(crate) struct ChangeNotifier {
    sender: broadcast::Sender<CredentialChange>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publishes a change
    ///
    /// Must be called while holding the manager's commit lock.
    pub fn publish(&self, kind: ChangeKind, sequence: u64, credentials: Arc<CredentialState>) {
        let change = CredentialChange {
            kind,
            sequence,
            credentials,
        };

        // An error only means that nobody is listening right now
        let _ = self.sender.send(change);
    }
}

/// A subscription to a manager's credential changes
///
/// Only changes committed after the subscription was created are observed.
#[derive(Debug)]
pub struct ChangeSubscription {
    receiver: broadcast::Receiver<CredentialChange>,
}

impl ChangeSubscription {
    /// Waits for the next change
    ///
    /// Returns `None` once the manager has been dropped. A subscriber that
    /// falls too far behind skips the oldest changes it missed.
    pub async fn recv(&mut self) -> Option<CredentialChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "credential change subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Takes the next change if one is already waiting
    pub fn try_recv(&mut self) -> Option<CredentialChange> {
        loop {
            match self.receiver.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "credential change subscriber lagged behind");
                }
                Err(_) => return None,
            }
        }
    }
}
