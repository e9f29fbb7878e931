//! Periodic detection of sessions that failed or never came up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use liboperator::{PreparationState, SessionState};

use crate::model::Session;
use crate::session::{Result, SessionService};

pub const DEFAULT_ALERT_THRESHOLD: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertReason {
    PreparationFailed,
    SessionFailed,
    /// Not running after the alert threshold.
    Stuck,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionAlert {
    pub session_id: String,
    pub owner_name: String,
    pub tool_id: String,
    pub reason: AlertReason,
    pub preparation: PreparationState,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &SessionAlert) -> anyhow::Result<()>;
}

/// Reports alerts to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &SessionAlert) -> anyhow::Result<()> {
        warn!(
            "Session {} of {} ({}) needs attention: {:?}, preparation {:?}, session {:?}",
            alert.session_id,
            alert.owner_name,
            alert.tool_id,
            alert.reason,
            alert.preparation,
            alert.state
        );
        Ok(())
    }
}

/// Decide whether a session deserves an alert.
pub fn alert_reason(
    session: &Session,
    preparation: PreparationState,
    state: SessionState,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Option<AlertReason> {
    if session.alerted || state.is_terminal() {
        return None;
    }
    if preparation == PreparationState::Failed {
        return Some(AlertReason::PreparationFailed);
    }
    if state == SessionState::Failed {
        return Some(AlertReason::SessionFailed);
    }
    let age = (now - session.created_at).to_std().unwrap_or_default();
    // an unknown state is an inspection error, not evidence of a stuck session
    if state != SessionState::Running && state != SessionState::Unknown && age > threshold {
        return Some(AlertReason::Stuck);
    }
    None
}

pub struct AlertingLoop {
    sessions: Arc<SessionService>,
    notifier: Arc<dyn Notifier>,
    threshold: Duration,
}

impl AlertingLoop {
    pub fn new(sessions: Arc<SessionService>, notifier: Arc<dyn Notifier>, threshold: Duration) -> Self {
        Self {
            sessions,
            notifier,
            threshold,
        }
    }

    /// Alert on every qualifying session once. Returns the number of alerts
    /// sent.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut sent = 0;
        for session in self.sessions.list_all_sessions().await? {
            if session.alerted {
                continue;
            }
            let (preparation, state) = self.sessions.get_session_state(&session.id).await;
            let Some(reason) = alert_reason(&session, preparation, state, now, self.threshold) else {
                continue;
            };

            let alert = SessionAlert {
                session_id: session.id.clone(),
                owner_name: session.owner_name.clone(),
                tool_id: session.tool_id.clone(),
                reason,
                preparation,
                state,
                created_at: session.created_at,
            };
            match self.notifier.notify(&alert).await {
                Ok(()) => {
                    self.sessions.mark_alerted(&session.id).await?;
                    sent += 1;
                }
                // retried on the next sweep
                Err(e) => warn!("Failed to send alert for session {}: {e}", session.id),
            }
        }
        Ok(sent)
    }

    pub fn spawn(self: Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match self.sweep(Utc::now()).await {
                            Ok(0) => {}
                            Ok(sent) => info!("Sent {sent} session alert(s)"),
                            Err(e) => error!("Session alerting sweep failed: {e}"),
                        }
                    }
                    _ = token.cancelled() => {
                        info!("Session alerting stopped");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use liboperator::SessionKind;

    use super::*;
    use crate::model::HookConfig;

    fn session(created_at: DateTime<Utc>) -> Session {
        Session {
            id: "s1".to_string(),
            owner_id: 1,
            owner_name: "alice".to_string(),
            kind: SessionKind::Persistent,
            tool_id: "jupyter".to_string(),
            version_id: "1".to_string(),
            connection_method_id: "http".to_string(),
            environment: HashMap::new(),
            config: HookConfig::new(),
            host: None,
            port: None,
            project_id: None,
            created_at,
            last_connected_at: None,
            alerted: false,
            shared_with: vec![],
        }
    }

    #[test]
    fn test_alert_reasons() {
        let now = Utc::now();
        let fresh = session(now);
        let old = session(now - chrono::Duration::minutes(30));
        let threshold = DEFAULT_ALERT_THRESHOLD;

        assert_eq!(
            alert_reason(&fresh, PreparationState::Failed, SessionState::Failed, now, threshold),
            Some(AlertReason::PreparationFailed)
        );
        assert_eq!(
            alert_reason(&fresh, PreparationState::Completed, SessionState::Failed, now, threshold),
            Some(AlertReason::SessionFailed)
        );
        assert_eq!(
            alert_reason(&fresh, PreparationState::Pending, SessionState::Pending, now, threshold),
            None
        );
        assert_eq!(
            alert_reason(&old, PreparationState::Pending, SessionState::Pending, now, threshold),
            Some(AlertReason::Stuck)
        );
        assert_eq!(
            alert_reason(&old, PreparationState::Completed, SessionState::Running, now, threshold),
            None
        );
        assert_eq!(
            alert_reason(&old, PreparationState::NotFound, SessionState::NotFound, now, threshold),
            None
        );

        let mut alerted = old.clone();
        alerted.alerted = true;
        assert_eq!(
            alert_reason(&alerted, PreparationState::Failed, SessionState::Failed, now, threshold),
            None
        );
    }
}
