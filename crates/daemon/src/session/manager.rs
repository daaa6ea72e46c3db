//! Session lifecycle: find-or-create by UUID and a purge loop that tears
//! down sessions once they have sat without clients past the grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use super::Session;
use crate::config::Config;

const PURGE_INTERVAL: Duration = Duration::from_secs(600);

pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    config: Arc<Config>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            config,
        });
        tokio::spawn(manager.clone().purge_loop());
        manager
    }

    /// Return the session with this id, or create a fresh one when the id
    /// is unknown or absent.
    pub async fn find_or_create_session(&self, id: Option<Uuid>) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = id.and_then(|id| sessions.get(&id).cloned()) {
            return Ok(session);
        }
        let session = Session::create(self.config.clone()).await?;
        sessions.insert(session.id(), session.clone());
        Ok(session)
    }

    /// Stop every session; used by the shutdown controller.
    pub async fn stop_all(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.stop().await;
        }
    }

    async fn purge_loop(self: Arc<Self>) {
        let grace = Duration::from_secs(self.config.session_purge_seconds);
        let mut empty_since: HashMap<Uuid, Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let mut expired = Vec::new();
            {
                let mut sessions = self.sessions.lock().await;
                for (session_id, session) in sessions.iter() {
                    if session.connections() == 0 {
                        match empty_since.get(session_id) {
                            Some(when) if now.duration_since(*when) > grace => {
                                expired.push(*session_id);
                            }
                            Some(_) => {}
                            None => {
                                empty_since.insert(*session_id, now);
                            }
                        }
                    } else {
                        empty_since.remove(session_id);
                    }
                }
                for session_id in &expired {
                    if let Some(session) = sessions.remove(session_id) {
                        empty_since.remove(session_id);
                        info!(session_id = %session_id, "terminating idle session");
                        tokio::spawn(async move { session.stop().await });
                    }
                }
            }
        }
    }
}
