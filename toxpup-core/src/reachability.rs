//! Per-peer reachability derived from the transport's connection reports.

use std::collections::HashMap;

use crate::identity::SessionHandle;

/// Connection state of one peer. Peers never reported on are `Unknown`,
/// which counts as unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    #[default]
    Unknown,
    Offline,
    Online,
}

/// Edge produced by a connection report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameOnline,
    BecameOffline,
    /// Report matched the current state.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ReachabilityTracker {
    peers: HashMap<SessionHandle, Reachability>,
}

impl ReachabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a connection report and return the edge it caused.
    pub fn update(&mut self, handle: SessionHandle, connected: bool) -> Transition {
        let next = if connected {
            Reachability::Online
        } else {
            Reachability::Offline
        };
        let prev = self.peers.insert(handle, next).unwrap_or_default();
        match (prev, next) {
            (Reachability::Online, Reachability::Online) => Transition::Unchanged,
            (_, Reachability::Online) => Transition::BecameOnline,
            (Reachability::Online, _) => Transition::BecameOffline,
            _ => Transition::Unchanged,
        }
    }

    pub fn state(&self, handle: SessionHandle) -> Reachability {
        self.peers.get(&handle).copied().unwrap_or_default()
    }

    pub fn is_reachable(&self, handle: SessionHandle) -> bool {
        self.state(handle) == Reachability::Online
    }

    /// Handles currently online.
    pub fn reachable(&self) -> Vec<SessionHandle> {
        let mut out: Vec<SessionHandle> = self
            .peers
            .iter()
            .filter(|(_, s)| **s == Reachability::Online)
            .map(|(h, _)| *h)
            .collect();
        out.sort();
        out
    }

    pub fn forget(&mut self, handle: SessionHandle) {
        self.peers.remove(&handle);
    }

    /// Every peer goes back to `Unknown`, e.g. after losing our own connection.
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_is_unreachable() {
        let tracker = ReachabilityTracker::new();
        assert_eq!(tracker.state(SessionHandle(1)), Reachability::Unknown);
        assert!(!tracker.is_reachable(SessionHandle(1)));
    }

    #[test]
    fn edges_are_reported_once() {
        let mut tracker = ReachabilityTracker::new();
        let h = SessionHandle(4);
        assert_eq!(tracker.update(h, false), Transition::Unchanged);
        assert_eq!(tracker.state(h), Reachability::Offline);
        assert_eq!(tracker.update(h, true), Transition::BecameOnline);
        assert_eq!(tracker.update(h, true), Transition::Unchanged);
        assert!(tracker.is_reachable(h));
        assert_eq!(tracker.update(h, false), Transition::BecameOffline);
        assert_eq!(tracker.update(h, false), Transition::Unchanged);
    }

    #[test]
    fn first_report_online_is_an_edge() {
        let mut tracker = ReachabilityTracker::new();
        assert_eq!(tracker.update(SessionHandle(9), true), Transition::BecameOnline);
    }

    #[test]
    fn reachable_lists_online_handles() {
        let mut tracker = ReachabilityTracker::new();
        tracker.update(SessionHandle(3), true);
        tracker.update(SessionHandle(1), true);
        tracker.update(SessionHandle(2), false);
        assert_eq!(tracker.reachable(), vec![SessionHandle(1), SessionHandle(3)]);
        tracker.forget(SessionHandle(1));
        assert_eq!(tracker.reachable(), vec![SessionHandle(3)]);
        tracker.clear();
        assert!(tracker.reachable().is_empty());
    }
}
