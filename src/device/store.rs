//! In-memory table of device sessions with user-code and state indexes

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use super::DeviceSession;

/// Which key was already taken when inserting
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertConflict {
    DeviceCode,
    UserCode,
    State,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, DeviceSession>,
    by_user_code: HashMap<String, String>,
    by_state: HashMap<String, String>,
}

impl Tables {
    fn drop_state_index(&mut self, state: &str, device_code: &str) {
        if self.by_state.get(state).map(String::as_str) == Some(device_code) {
            self.by_state.remove(state);
        }
    }
}

/// Owns every [`DeviceSession`]. One lock covers the primary map and both
/// secondary indexes, so they always change together.
#[derive(Default)]
pub struct DeviceSessionStore {
    tables: Mutex<Tables>,
}

impl DeviceSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, session: DeviceSession) -> Result<(), InsertConflict> {
        let mut tables = self.tables.lock().await;
        if tables.sessions.contains_key(&session.device_code) {
            return Err(InsertConflict::DeviceCode);
        }
        if tables
            .by_user_code
            .contains_key(&session.normalized_user_code)
        {
            return Err(InsertConflict::UserCode);
        }
        if tables.by_state.contains_key(&session.state) {
            return Err(InsertConflict::State);
        }
        tables.by_user_code.insert(
            session.normalized_user_code.clone(),
            session.device_code.clone(),
        );
        tables
            .by_state
            .insert(session.state.clone(), session.device_code.clone());
        tables
            .sessions
            .insert(session.device_code.clone(), session);
        Ok(())
    }

    /// Snapshot of the session, never a live reference
    pub async fn get_by_device_code(&self, device_code: &str) -> Option<DeviceSession> {
        self.tables.lock().await.sessions.get(device_code).cloned()
    }

    pub async fn get_device_code_by_user_code(&self, normalized: &str) -> Option<String> {
        self.tables.lock().await.by_user_code.get(normalized).cloned()
    }

    pub async fn get_device_code_by_state(&self, state: &str) -> Option<String> {
        self.tables.lock().await.by_state.get(state).cloned()
    }

    /// Run `f` against the session under the table lock. Returns `None` when the
    /// device code is unknown. A session that ends up terminal, or whose state
    /// was redeemed, loses its state index entry before the lock is released.
    pub async fn mutate<F, R>(&self, device_code: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut DeviceSession) -> R,
    {
        let mut tables = self.tables.lock().await;
        let session = tables.sessions.get_mut(device_code)?;
        let result = f(session);
        if session.status.is_terminal() || session.state_redeemed {
            let state = session.state.clone();
            tables.drop_state_index(&state, device_code);
        }
        Some(result)
    }

    /// Drop the session and all its index entries. Safe to call repeatedly.
    pub async fn remove(&self, device_code: &str) {
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.sessions.remove(device_code) else {
            return;
        };
        if tables
            .by_user_code
            .get(&session.normalized_user_code)
            .map(String::as_str)
            == Some(device_code)
        {
            tables.by_user_code.remove(&session.normalized_user_code);
        }
        tables.drop_state_index(&session.state, device_code);
        debug!(user_code = %session.user_code, "removed device session");
    }

    /// Device codes of every session matching `pred`
    pub async fn device_codes_where<P>(&self, pred: P) -> Vec<String>
    where
        P: Fn(&DeviceSession) -> bool,
    {
        self.tables
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| pred(s))
            .map(|s| s.device_code.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::device::{DeviceStatus, Provider};

    #[tokio::test]
    async fn create_indexes_all_keys() {
        let store = DeviceSessionStore::new();
        let session = DeviceSession::new(Provider::Google, Utc::now());
        store.create(session.clone()).await.expect("create");

        assert!(store
            .get_by_device_code(&session.device_code)
            .await
            .is_some());
        assert_eq!(
            store
                .get_device_code_by_user_code(&session.normalized_user_code)
                .await,
            Some(session.device_code.clone())
        );
        assert_eq!(
            store.get_device_code_by_state(&session.state).await,
            Some(session.device_code.clone())
        );
    }

    #[tokio::test]
    async fn create_rejects_taken_keys() {
        let store = DeviceSessionStore::new();
        let session = DeviceSession::new(Provider::Google, Utc::now());
        store.create(session.clone()).await.expect("create");

        assert_eq!(
            store.create(session.clone()).await,
            Err(InsertConflict::DeviceCode)
        );

        let mut same_user_code = DeviceSession::new(Provider::Github, Utc::now());
        same_user_code.normalized_user_code = session.normalized_user_code.clone();
        assert_eq!(
            store.create(same_user_code).await,
            Err(InsertConflict::UserCode)
        );

        let mut same_state = DeviceSession::new(Provider::Github, Utc::now());
        same_state.state = session.state.clone();
        assert_eq!(store.create(same_state).await, Err(InsertConflict::State));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn terminal_mutation_clears_state_index_only() {
        let store = DeviceSessionStore::new();
        let session = DeviceSession::new(Provider::Github, Utc::now());
        store.create(session.clone()).await.expect("create");

        store
            .mutate(&session.device_code, |s| s.status = DeviceStatus::Authorizing)
            .await
            .expect("known session");
        assert!(store.get_device_code_by_state(&session.state).await.is_some());

        store
            .mutate(&session.device_code, |s| {
                s.finish(DeviceStatus::Error, Utc::now(), Some("denied".into()))
            })
            .await
            .expect("known session");
        assert!(store.get_device_code_by_state(&session.state).await.is_none());
        assert!(store
            .get_device_code_by_user_code(&session.normalized_user_code)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn redeemed_state_leaves_the_index() {
        let store = DeviceSessionStore::new();
        let session = DeviceSession::new(Provider::Google, Utc::now());
        store.create(session.clone()).await.expect("create");

        store
            .mutate(&session.device_code, |s| {
                s.status = DeviceStatus::Authorizing;
                s.state_redeemed = true;
            })
            .await
            .expect("known session");
        assert!(store.get_device_code_by_state(&session.state).await.is_none());
        assert!(store.get_by_device_code(&session.device_code).await.is_some());
    }

    #[tokio::test]
    async fn snapshots_are_detached() {
        let store = DeviceSessionStore::new();
        let session = DeviceSession::new(Provider::Google, Utc::now());
        store.create(session.clone()).await.expect("create");

        let mut snapshot = store
            .get_by_device_code(&session.device_code)
            .await
            .expect("snapshot");
        snapshot.status = DeviceStatus::Complete;

        let fresh = store
            .get_by_device_code(&session.device_code)
            .await
            .expect("snapshot");
        assert_eq!(fresh.status, DeviceStatus::Pending);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = DeviceSessionStore::new();
        let session = DeviceSession::new(Provider::Google, Utc::now());
        store.create(session.clone()).await.expect("create");

        store.remove(&session.device_code).await;
        store.remove(&session.device_code).await;
        assert!(store.is_empty().await);
        assert!(store
            .get_device_code_by_user_code(&session.normalized_user_code)
            .await
            .is_none());
        assert!(store.get_device_code_by_state(&session.state).await.is_none());
        assert!(store.mutate(&session.device_code, |_| ()).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_transitions_are_serialized() {
        let store = Arc::new(DeviceSessionStore::new());
        let session = DeviceSession::new(Provider::Google, Utc::now());
        store.create(session.clone()).await.expect("create");

        // every task tries pending -> authorizing, only one may win
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let code = session.device_code.clone();
            handles.push(tokio::spawn(async move {
                store
                    .mutate(&code, |s| {
                        if s.status == DeviceStatus::Pending {
                            s.status = DeviceStatus::Authorizing;
                            true
                        } else {
                            false
                        }
                    })
                    .await
                    .unwrap_or(false)
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task panicked") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
