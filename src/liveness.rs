//! Periodic liveness sweep over every registered connection.
//!
//! Each pass pings everything that answered since the previous pass and
//! terminates everything that did not — through the engine's shared teardown
//! path, so a silently dead socket behaves exactly like an explicit leave.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::session::SessionEngine;

/// Spawn the sweep task. Aborting the returned handle stops the monitor.
pub fn spawn_liveness_monitor(engine: Arc<SessionEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; connections registered
        // before startup should not be swept on it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let terminated = engine.sweep_connections().await;
            if terminated > 0 {
                log::info!("liveness sweep terminated {terminated} connection(s)");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionRegistry, Outbound};
    use crate::store::{MembershipStore, MessageLog, RoomStore};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_monitor_terminates_dead_connection() {
        let engine = Arc::new(SessionEngine::new(
            RoomStore::new(),
            MembershipStore::new(),
            MessageLog::new(),
            ConnectionRegistry::new(),
            Duration::from_millis(20),
        ));

        let room = engine
            .rooms()
            .create("R1", "sesame1", Uuid::new_v4())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let user = Uuid::new_v4();
        engine
            .join(tx, room.id, "Ghost".into(), "sesame1", user, false)
            .await
            .unwrap();

        let monitor = spawn_liveness_monitor(engine.clone(), Duration::from_millis(20));

        // The connection never answers its ping, so within two sweep
        // intervals it must be gone — and the empty room with it.
        let deadline = Duration::from_secs(2);
        let mut saw_ping = false;
        loop {
            match timeout(deadline, rx.recv()).await.expect("sweep stalled") {
                Some(Outbound::Ping) => saw_ping = true,
                Some(Outbound::Close) => break,
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_ping);
        assert!(engine.members().get(user).await.is_none());
        assert!(engine.rooms().get(room.id).await.is_none());

        monitor.abort();
    }
}
