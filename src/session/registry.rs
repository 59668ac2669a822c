use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::Gauge;
use tracing::debug;

use super::session::{Session, SessionId};

type SessionSet = HashMap<SessionId, Arc<Session>>;

/// 会话注册表
///
/// 只由调度引擎持有和修改，因此不加锁。
/// 一个会话在用户索引中存在，当且仅当它在其每个订阅群组的索引中存在。
pub struct Registry {
    by_user: HashMap<String, SessionSet>,
    by_group: HashMap<String, SessionSet>,
    connections: usize,
    gauge: Gauge,
}

/// 注册表统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub groups: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Gauge::noop())
    }
}

impl Registry {
    pub fn new(gauge: Gauge) -> Self {
        Self {
            by_user: HashMap::new(),
            by_group: HashMap::new(),
            connections: 0,
            gauge,
        }
    }

    /// 加入用户索引与各订阅群组索引；重复加入同一会话不产生副本，返回 false
    pub fn add(&mut self, session: Arc<Session>) -> bool {
        let sessions = self.by_user.entry(session.user_id().to_string()).or_default();
        if sessions.contains_key(&session.id()) {
            return false;
        }
        sessions.insert(session.id(), session.clone());

        for group in session.subscriptions() {
            self.by_group
                .entry(group.clone())
                .or_default()
                .insert(session.id(), session.clone());
        }

        self.connections += 1;
        self.gauge.set(self.connections as f64);
        debug!(
            user_id = %session.user_id(),
            session_id = %session.id(),
            groups = session.subscriptions().len(),
            "会话已注册"
        );
        true
    }

    /// 从所有索引移除并关闭出站缓冲；会话不存在时什么也不做，返回 false
    pub fn remove(&mut self, session: &Session) -> bool {
        let Some(sessions) = self.by_user.get_mut(session.user_id()) else {
            return false;
        };
        if sessions.remove(&session.id()).is_none() {
            return false;
        }
        if sessions.is_empty() {
            self.by_user.remove(session.user_id());
        }

        for group in session.subscriptions() {
            if let Some(members) = self.by_group.get_mut(group) {
                members.remove(&session.id());
                if members.is_empty() {
                    self.by_group.remove(group);
                }
            }
        }

        session.close();
        self.connections = self.connections.saturating_sub(1);
        self.gauge.set(self.connections as f64);
        debug!(
            user_id = %session.user_id(),
            session_id = %session.id(),
            "会话已移除"
        );
        true
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        self.by_user
            .get(user_id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sessions_for_group(&self, group_id: &str) -> Vec<Arc<Session>> {
        self.by_group
            .get(group_id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }

    pub fn all_sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.by_user.values().flat_map(|s| s.values())
    }

    /// 每个在线用户的会话数
    pub fn user_counts(&self) -> impl Iterator<Item = (&str, usize)> {
        self.by_user.iter().map(|(user, s)| (user.as_str(), s.len()))
    }

    /// 每个群组的在线会话数
    pub fn group_counts(&self) -> impl Iterator<Item = (&str, usize)> {
        self.by_group.iter().map(|(group, s)| (group.as_str(), s.len()))
    }

    /// 活跃时间早于 `cutoff` 的会话
    pub fn stale_sessions(&self, cutoff: DateTime<Utc>) -> Vec<Arc<Session>> {
        self.all_sessions()
            .filter(|s| s.is_stale(cutoff))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections
    }

    pub fn is_empty(&self) -> bool {
        self.connections == 0
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections,
            users: self.by_user.len(),
            groups: self.by_group.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut registry = Registry::default();
        let (session, _rx) = Session::new("alice", ["g1", "g2"], 4);

        assert!(registry.add(session.clone()));
        assert!(!registry.add(session.clone()));

        assert_eq!(registry.sessions_for_group("g1").len(), 1);
        assert_eq!(registry.sessions_for_group("g2").len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_symmetric_and_idempotent() {
        let mut registry = Registry::default();
        let (a, _rx_a) = Session::new("alice", ["g1"], 4);
        let (b, _rx_b) = Session::new("alice", ["g1"], 4);
        registry.add(a.clone());
        registry.add(b.clone());

        assert!(registry.remove(&a));
        assert!(a.is_closed());
        assert!(!registry.remove(&a));

        assert_eq!(registry.sessions_for_user("alice").len(), 1);
        assert_eq!(registry.sessions_for_group("g1").len(), 1);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                connections: 1,
                users: 1,
                groups: 1
            }
        );

        registry.remove(&b);
        assert!(registry.is_empty());
        assert!(registry.sessions_for_group("g1").is_empty());
        assert!(!registry.is_user_online("alice"));
    }

    #[test]
    fn test_lookup_unknown_is_empty() {
        let registry = Registry::default();
        assert!(registry.sessions_for_user("nobody").is_empty());
        assert!(registry.sessions_for_group("nothing").is_empty());
    }
}
