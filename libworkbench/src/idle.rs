use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::model::Session;
use crate::session::{Result, SessionService};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);

/// Terminates sessions nobody connected to for too long.
pub struct IdleSweep {
    sessions: Arc<SessionService>,
    idle_timeout: Duration,
}

pub fn is_idle(session: &Session, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
    (now - session.last_activity())
        .to_std()
        .is_ok_and(|idle| idle > idle_timeout)
}

impl IdleSweep {
    pub fn new(sessions: Arc<SessionService>, idle_timeout: Duration) -> Self {
        Self {
            sessions,
            idle_timeout,
        }
    }

    /// Returns the number of terminated sessions.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut terminated = 0;
        for session in self.sessions.list_all_sessions().await? {
            if !is_idle(&session, now, self.idle_timeout) {
                continue;
            }
            info!(
                "Terminating session {} of {}, idle since {}",
                session.id,
                session.owner_name,
                session.last_activity()
            );
            match self.sessions.terminate(&session).await {
                Ok(()) => terminated += 1,
                Err(e) => error!("Failed to terminate idle session {}: {e}", session.id),
            }
        }
        Ok(terminated)
    }

    pub fn spawn(self: Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = self.sweep(Utc::now()).await {
                            error!("Idle session sweep failed: {e}");
                        }
                    }
                    _ = token.cancelled() => {
                        info!("Idle session sweep stopped");
                        return;
                    }
                }
            }
        })
    }
}
