use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Workspace id used for the process-wide session.
pub const GLOBAL_SCOPE: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    pub started_at: DateTime<Utc>,
}

impl Session {
    fn start(workspace_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            workspace_id: workspace_id.to_string(),
            started_at: now,
        }
    }
}

/// Tracks the active session per workspace plus one global session.
///
/// Inactivity rotation applies to the global session only. Per-workspace
/// sessions are assigned on first activity and keep their id across global
/// rotations, so entries from one workspace stay grouped while another
/// workspace goes idle.
#[derive(Debug)]
pub struct SessionRegistry {
    global: Session,
    by_workspace: HashMap<String, Session>,
    last_activity: DateTime<Utc>,
    inactivity_timeout: Duration,
    rotated_while_idle: bool,
    rotations: u64,
}

impl SessionRegistry {
    pub fn new(now: DateTime<Utc>, inactivity_timeout: Duration) -> Self {
        Self {
            global: Session::start(GLOBAL_SCOPE, now),
            by_workspace: HashMap::new(),
            last_activity: now,
            inactivity_timeout,
            rotated_while_idle: false,
            rotations: 0,
        }
    }

    /// Records activity in a workspace and returns its session.
    pub fn touch(&mut self, workspace_id: &str, now: DateTime<Utc>) -> &Session {
        if now > self.last_activity {
            self.last_activity = now;
        }
        self.rotated_while_idle = false;

        self.by_workspace
            .entry(workspace_id.to_string())
            .or_insert_with(|| {
                let session = Session::start(workspace_id, now);
                debug!(
                    workspace_id = %workspace_id,
                    session_id = %session.id,
                    "Workspace session started"
                );
                session
            })
    }

    pub fn session_for(&self, workspace_id: &str) -> Option<&Session> {
        self.by_workspace.get(workspace_id)
    }

    pub fn current(&self) -> &Session {
        &self.global
    }

    /// Rotates the global session when the inactivity ceiling has passed.
    /// Rotation happens at most once per idle period.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> Option<&Session> {
        if self.rotated_while_idle {
            return None;
        }
        let idle = now.signed_duration_since(self.last_activity);
        if idle <= self.inactivity_timeout {
            return None;
        }

        let previous = std::mem::replace(&mut self.global, Session::start(GLOBAL_SCOPE, now));
        self.rotated_while_idle = true;
        self.rotations += 1;
        info!(
            previous_session_id = %previous.id,
            session_id = %self.global.id,
            idle_secs = idle.num_seconds(),
            "Global session rotated after inactivity"
        );
        Some(&self.global)
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn workspace_count(&self) -> usize {
        self.by_workspace.len()
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T09:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(t0(), Duration::minutes(30))
    }

    #[test]
    fn touch_assigns_stable_workspace_session() {
        let mut sessions = registry();
        let first = sessions.touch("ws-a", t0()).id.clone();
        let second = sessions
            .touch("ws-a", t0() + Duration::minutes(10))
            .id
            .clone();
        assert_eq!(first, second);
        assert_eq!(sessions.workspace_count(), 1);
    }

    #[test]
    fn workspaces_get_distinct_sessions() {
        let mut sessions = registry();
        let a = sessions.touch("ws-a", t0()).id.clone();
        let b = sessions.touch("ws-b", t0()).id.clone();
        assert_ne!(a, b);
    }

    #[test]
    fn rotates_global_session_after_inactivity() {
        let mut sessions = registry();
        sessions.touch("ws-a", t0());
        let before = sessions.current().id.clone();

        assert!(sessions.check_timeout(t0() + Duration::minutes(30)).is_none());

        let rotated = sessions
            .check_timeout(t0() + Duration::minutes(31))
            .expect("rotation")
            .clone();
        assert_ne!(rotated.id, before);
        assert_eq!(rotated.started_at, t0() + Duration::minutes(31));
        assert_eq!(rotated.workspace_id, GLOBAL_SCOPE);
        assert_eq!(sessions.rotations(), 1);
    }

    #[test]
    fn rotation_keeps_workspace_sessions() {
        let mut sessions = registry();
        let workspace_session = sessions.touch("ws-a", t0()).id.clone();
        sessions.check_timeout(t0() + Duration::hours(1));

        let after = sessions
            .touch("ws-a", t0() + Duration::hours(1))
            .id
            .clone();
        assert_eq!(after, workspace_session);
    }

    #[test]
    fn rotates_once_per_idle_period() {
        let mut sessions = registry();
        assert!(sessions.check_timeout(t0() + Duration::minutes(40)).is_some());
        assert!(sessions.check_timeout(t0() + Duration::minutes(45)).is_none());

        sessions.touch("ws-a", t0() + Duration::minutes(50));
        assert!(sessions.check_timeout(t0() + Duration::minutes(81)).is_some());
        assert_eq!(sessions.rotations(), 2);
    }
}
