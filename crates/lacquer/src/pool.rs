use std::collections::HashMap;
use std::time::Instant;

use mio::Token;

use crate::connection::ConnectionMeta;

/// What the reactor should do to satisfy a request for an origin.
///
/// `reap` lists connections past their keep-alive budget; they must be
/// closed before `action` is carried out.
#[derive(Debug, PartialEq, Eq)]
pub struct Plan {
    pub reap: Vec<Token>,
    pub action: Action,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Open a fresh connection to the origin.
    Open,
    /// Reuse an existing live connection.
    Reuse(Token),
}

/// Tracks which pooled upstream connections belong to which origin.
///
/// Selection is deliberately simple: uniform random over survivors, no
/// health awareness, no fairness. A freshly opened connection can be picked
/// again immediately once the per-origin cap is reached.
pub struct UpstreamPool {
    origins: HashMap<String, Vec<Token>>,
    cap: usize,
}

impl UpstreamPool {
    pub fn new(cap: usize) -> Self {
        Self {
            origins: HashMap::new(),
            cap,
        }
    }

    pub fn insert(&mut self, origin: &str, token: Token) {
        self.origins.entry(origin.to_string()).or_default().push(token);
    }

    pub fn remove(&mut self, token: Token) {
        for tokens in self.origins.values_mut() {
            tokens.retain(|candidate| *candidate != token);
        }
    }

    pub fn tokens(&self, origin: &str) -> &[Token] {
        self.origins.get(origin).map_or(&[], Vec::as_slice)
    }

    /// Decide between reuse and open for one origin.
    ///
    /// Takes metadata snapshots rather than live connections so the policy
    /// can be exercised without sockets. Expired and exhausted entries are
    /// reaped first; if fewer than the cap survive, a new connection is
    /// opened, otherwise a uniformly random survivor is reused.
    pub fn plan(&self, entries: &[(Token, ConnectionMeta)], now: Instant) -> Plan {
        let mut reap = Vec::new();
        let mut live = Vec::new();
        for (token, meta) in entries {
            if meta.expired(now) || meta.exhausted() {
                reap.push(*token);
            } else {
                live.push(*token);
            }
        }

        let action = if live.len() < self.cap {
            Action::Open
        } else {
            Action::Reuse(live[fastrand::usize(..live.len())])
        };

        Plan { reap, action }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn meta(now: Instant) -> ConnectionMeta {
        ConnectionMeta::new(now, None)
    }

    #[test]
    fn opens_below_cap() {
        let pool = UpstreamPool::new(4);
        let now = Instant::now();
        let entries: Vec<_> = (0..3).map(|i| (Token(i), meta(now))).collect();

        let plan = pool.plan(&entries, now);
        assert!(plan.reap.is_empty());
        assert_eq!(plan.action, Action::Open);
    }

    #[test]
    fn reuses_at_cap() {
        let pool = UpstreamPool::new(4);
        let now = Instant::now();
        let entries: Vec<_> = (0..4).map(|i| (Token(i), meta(now))).collect();

        // A 5th concurrent request must reuse, never open
        for _ in 0..32 {
            let plan = pool.plan(&entries, now);
            let Action::Reuse(token) = plan.action else {
                panic!("expected reuse at capacity");
            };
            assert!(entries.iter().any(|(candidate, _)| *candidate == token));
        }
    }

    #[test]
    fn reaps_expired_before_opening() {
        let pool = UpstreamPool::new(4);
        let start = Instant::now();
        let mut stale = meta(start);
        stale.learn(Some(Duration::from_secs(1)), None);
        let entries = vec![
            (Token(0), stale),
            (Token(1), meta(start)),
        ];

        let now = start + Duration::from_secs(5);
        let plan = pool.plan(&entries, now);
        assert_eq!(plan.reap, vec![Token(0)]);
        assert_eq!(plan.action, Action::Open);
    }

    #[test]
    fn reaps_exhausted_connections() {
        let pool = UpstreamPool::new(1);
        let now = Instant::now();
        let mut spent = meta(now);
        spent.learn(None, Some(3));
        spent.served = 3;

        let plan = pool.plan(&[(Token(7), spent)], now);
        assert_eq!(plan.reap, vec![Token(7)]);
        // Nothing live remains, so a new connection is opened
        assert_eq!(plan.action, Action::Open);
    }

    #[test]
    fn bookkeeping_tracks_membership() {
        let mut pool = UpstreamPool::new(4);
        pool.insert("a:80", Token(1));
        pool.insert("a:80", Token(2));
        pool.insert("b:80", Token(3));

        assert_eq!(pool.tokens("a:80"), &[Token(1), Token(2)]);
        pool.remove(Token(1));
        assert_eq!(pool.tokens("a:80"), &[Token(2)]);
        assert_eq!(pool.tokens("missing:80"), &[] as &[Token]);
    }
}
