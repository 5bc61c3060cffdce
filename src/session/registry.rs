//! Session registry: one actor per session key, created on demand.
//!
//! The map is the single place an actor can be reached from, so removing an
//! entry is what retires a session. Creation double-checks under the write
//! lock; stopping a replaced actor happens off-lock so slow teardown never
//! blocks other sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use super::activity::ActivityBus;
use super::actor::{SessionActor, SessionError};
use crate::agent::AgentConnector;
use crate::config::Config;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionActor>>>,
    connector: Arc<dyn AgentConnector>,
    activity: Arc<ActivityBus>,
    session_ttl: Duration,
    response_timeout: Duration,
    greeting_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(
        config: &Config,
        connector: Arc<dyn AgentConnector>,
        activity: Arc<ActivityBus>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            connector,
            activity,
            session_ttl: config.session_ttl,
            response_timeout: config.response_timeout,
            greeting_timeout: config.greeting_timeout,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Return the live actor for a key, spawning one if the slot is empty or
    /// holds a dead or expired actor.
    pub async fn get_or_create(&self, session_id: &str) -> Result<Arc<SessionActor>, SessionError> {
        validate_session_key(session_id)?;

        {
            let sessions = self.sessions.read().await;
            if let Some(actor) = sessions.get(session_id) {
                if actor.is_alive() && !actor.is_expired(self.session_ttl) {
                    actor.touch();
                    return Ok(Arc::clone(actor));
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        // Re-check: another caller may have created it while we waited.
        if let Some(actor) = sessions.get(session_id) {
            if actor.is_alive() && !actor.is_expired(self.session_ttl) {
                actor.touch();
                return Ok(Arc::clone(actor));
            }
        }
        if let Some(stale) = sessions.remove(session_id) {
            info!(
                "Session {}: replacing {} actor",
                session_id,
                if stale.is_alive() { "expired" } else { "dead" }
            );
            tokio::spawn(async move { stale.stop().await });
        }

        info!("Session {}: spawning actor", session_id);
        let actor = SessionActor::spawn(
            session_id,
            Arc::clone(&self.connector),
            Arc::clone(&self.activity),
            self.response_timeout,
            self.greeting_timeout,
        );
        sessions.insert(session_id.to_string(), Arc::clone(&actor));
        Ok(actor)
    }

    /// Look up without creating.
    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionActor>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Stop and forget a session. Returns false if it was not present.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(actor) => {
                actor.stop().await;
                self.activity.remove(session_id).await;
                info!("Session {}: closed", session_id);
                true
            }
            None => false,
        }
    }

    /// Drop every session idle past the TTL or whose worker has died.
    pub async fn sweep_expired(&self) -> usize {
        let candidates: Vec<(String, Arc<SessionActor>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, actor)| actor.is_expired(self.session_ttl) || !actor.is_alive())
                .map(|(id, actor)| (id.clone(), Arc::clone(actor)))
                .collect()
        };

        let mut removed = 0;
        for (session_id, candidate) in candidates {
            let taken = {
                let mut sessions = self.sessions.write().await;
                match sessions.get(&session_id) {
                    // Skip slots replaced since the scan.
                    Some(current) if Arc::ptr_eq(current, &candidate) => {
                        sessions.remove(&session_id)
                    }
                    _ => None,
                }
            };
            if let Some(actor) = taken {
                info!(
                    "Session {}: swept after {:?} idle",
                    session_id,
                    actor.idle_for()
                );
                actor.stop().await;
                self.activity.remove(&session_id).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Sweep removed {} session(s)", removed);
        }
        removed
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep_expired().await;
            }
        })
    }
}

fn validate_session_key(key: &str) -> Result<(), SessionError> {
    match Uuid::try_parse(key) {
        Ok(id) if id.get_version_num() == 4 => Ok(()),
        _ => Err(SessionError::InvalidKey(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedConnector;
    use std::path::PathBuf;

    const SESSION_A: &str = "0a0e8f4e-1db5-4f97-9b2f-52fa2b8f1a01";
    const SESSION_B: &str = "3f1b2d6a-58c4-4f2e-8d2a-9a7c5b3e2f02";

    fn registry(connector: Arc<ScriptedConnector>, ttl_ms: u64) -> Arc<SessionRegistry> {
        let mut config = Config::new(PathBuf::from("/tmp"));
        config.session_ttl = Duration::from_millis(ttl_ms);
        config.response_timeout = Duration::from_secs(5);
        config.greeting_timeout = Duration::from_millis(500);
        Arc::new(SessionRegistry::new(
            &config,
            connector,
            Arc::new(ActivityBus::new()),
        ))
    }

    #[tokio::test]
    async fn rejects_keys_that_are_not_uuid_v4() {
        let registry = registry(ScriptedConnector::new(vec![]), 60_000);

        let err = registry.get_or_create("definitely-not-a-uuid").await.err().unwrap();
        assert!(matches!(err, SessionError::InvalidKey(_)));

        // Valid UUID, but version 1.
        let err = registry
            .get_or_create("2c5ea4c0-4067-11e9-8bad-9b1deb4d3b7d")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn same_key_returns_same_actor() {
        let registry = registry(ScriptedConnector::new(vec![]), 60_000);

        let first = registry.get_or_create(SESSION_A).await.unwrap();
        let second = registry.get_or_create(SESSION_A).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = registry.get_or_create(SESSION_B).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn expired_actor_is_replaced_on_access() {
        let registry = registry(ScriptedConnector::new(vec![]), 50);

        let first = registry.get_or_create(SESSION_A).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let second = registry.get_or_create(SESSION_A).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn dead_actor_is_replaced_on_access() {
        let registry = registry(ScriptedConnector::failing(), 60_000);

        let first = registry.get_or_create(SESSION_A).await.unwrap();
        // Wait for the failed connect to kill the worker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_alive());

        let second = registry.get_or_create(SESSION_A).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let registry = registry(ScriptedConnector::new(vec![]), 60);

        registry.get_or_create(SESSION_A).await.unwrap();
        let keep = registry.get_or_create(SESSION_B).await.unwrap();

        tokio::time::sleep(Duration::from_millis(90)).await;
        keep.touch();

        let removed = registry.sweep_expired().await;
        assert_eq!(removed, 1);
        assert!(registry.get(SESSION_A).await.is_none());
        assert!(registry.get(SESSION_B).await.is_some());

        // A fresh access after the sweep creates a brand new actor.
        let replacement = registry.get_or_create(SESSION_A).await.unwrap();
        assert!(replacement.is_alive());
    }

    #[tokio::test]
    async fn remove_stops_the_actor() {
        let registry = registry(ScriptedConnector::new(vec![]), 60_000);

        let actor = registry.get_or_create(SESSION_A).await.unwrap();
        actor.greeting().await;

        assert!(registry.remove(SESSION_A).await);
        assert!(!actor.is_alive());
        assert!(registry.get(SESSION_A).await.is_none());

        // Second remove is a no-op.
        assert!(!registry.remove(SESSION_A).await);
    }
}
