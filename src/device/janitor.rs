//! Sweep-on-access cleanup of dead device sessions

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use super::{DeviceSession, DeviceSessionStore};
use crate::constants::TERMINAL_GRACE_SECS;

/// A session is stale once it has sat finished for longer than the grace
/// period, or stayed unfinished for the grace period past its expiry. The
/// window between expiry and staleness is when a poll still answers "expired".
pub fn is_stale(session: &DeviceSession, now: DateTime<Utc>) -> bool {
    let grace = TimeDelta::seconds(TERMINAL_GRACE_SECS);
    match session.completed_at {
        Some(completed_at) if session.status.is_terminal() => now >= completed_at + grace,
        _ => now >= session.expires_at + grace,
    }
}

/// Remove every stale session, returning how many went away
pub async fn sweep(store: &DeviceSessionStore, now: DateTime<Utc>) -> usize {
    let stale = store.device_codes_where(|s| is_stale(s, now)).await;
    for device_code in &stale {
        store.remove(device_code).await;
    }
    if !stale.is_empty() {
        debug!(count = stale.len(), "swept stale device sessions");
    }
    stale.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SESSION_TTL_SECS;
    use crate::device::{DeviceStatus, Provider};

    #[test]
    fn live_session_is_not_stale() {
        let now = Utc::now();
        let session = DeviceSession::new(Provider::Google, now);
        assert!(!is_stale(&session, now));
        // expired, but still inside the grace window
        assert!(!is_stale(
            &session,
            now + TimeDelta::seconds(SESSION_TTL_SECS + 1)
        ));
        assert!(is_stale(
            &session,
            now + TimeDelta::seconds(SESSION_TTL_SECS + TERMINAL_GRACE_SECS)
        ));
    }

    #[test]
    fn finished_session_goes_stale_after_grace() {
        let now = Utc::now();
        let mut session = DeviceSession::new(Provider::Github, now);
        session.finish(DeviceStatus::Error, now, Some("denied".to_string()));
        assert!(!is_stale(&session, now + TimeDelta::seconds(60)));
        assert!(is_stale(
            &session,
            now + TimeDelta::seconds(TERMINAL_GRACE_SECS)
        ));
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_sessions() {
        let store = DeviceSessionStore::new();
        let now = Utc::now();

        let fresh = DeviceSession::new(Provider::Google, now);
        let mut finished = DeviceSession::new(Provider::Google, now);
        finished.finish(DeviceStatus::Expired, now, None);
        store.create(fresh.clone()).await.expect("create");
        store.create(finished.clone()).await.expect("create");

        let later = now + TimeDelta::seconds(TERMINAL_GRACE_SECS + 1);
        assert_eq!(sweep(&store, later).await, 1);
        assert!(store.get_by_device_code(&fresh.device_code).await.is_some());
        assert!(store
            .get_by_device_code(&finished.device_code)
            .await
            .is_none());
        assert_eq!(sweep(&store, later).await, 0);
    }
}
