// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation routing between api workers and task runners.
//!
//! Pure bookkeeping: which task runner serves which correlation, with a
//! supervisor-side deadline per route. The supervisor drives it from its
//! event loop.

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

use crate::pool::Pool;
use crate::worker::SlotKey;

/// One in-flight offloaded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// The api worker awaiting the reply.
    pub origin: SlotKey,
    /// The task runner executing the call.
    pub target: SlotKey,
    /// When the supervisor gives up on the runner.
    pub deadline: Instant,
}

/// Routes `ExecuteInvoke` calls over a round-robin runner pool and tracks
/// them until completion, expiry, or worker loss.
pub struct Router {
    runners: Pool<SlotKey>,
    routes: HashMap<Uuid, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            runners: Pool::new(),
            routes: HashMap::new(),
        }
    }

    pub fn add_runner(&mut self, key: SlotKey) {
        self.runners.add(key);
    }

    pub fn remove_runner(&mut self, key: SlotKey) {
        self.runners.remove(&key);
    }

    pub fn has_runners(&self) -> bool {
        !self.runners.is_empty()
    }

    pub fn inflight(&self) -> usize {
        self.routes.len()
    }

    /// Pick the next runner and record the route. `None` when no runner is
    /// available.
    pub fn assign(
        &mut self,
        correlation_id: Uuid,
        origin: SlotKey,
        deadline: Instant,
    ) -> Option<SlotKey> {
        let target = self.runners.next()?;
        self.routes.insert(
            correlation_id,
            Route {
                origin,
                target,
                deadline,
            },
        );
        Some(target)
    }

    /// Complete a route, returning where the reply goes.
    pub fn complete(&mut self, correlation_id: Uuid) -> Option<Route> {
        self.routes.remove(&correlation_id)
    }

    /// Remove and return every route whose deadline passed.
    pub fn expired(&mut self, now: Instant) -> Vec<(Uuid, Route)> {
        let expired: Vec<Uuid> = self
            .routes
            .iter()
            .filter(|(_, route)| route.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.routes.remove(&id).map(|route| (id, route)))
            .collect()
    }

    /// Drop every route touching a lost worker. Returns the routes that were
    /// targeting it (their originators must hear `TaskWorkerLost`) and the
    /// routes originating from it (their targets deserve a best-effort
    /// abort).
    pub fn worker_lost(&mut self, key: SlotKey) -> (Vec<(Uuid, Route)>, Vec<(Uuid, Route)>) {
        self.runners.remove(&key);

        let affected: Vec<Uuid> = self
            .routes
            .iter()
            .filter(|(_, route)| route.target == key || route.origin == key)
            .map(|(id, _)| *id)
            .collect();

        let mut targeting = Vec::new();
        let mut originating = Vec::new();
        for id in affected {
            let Some(route) = self.routes.remove(&id) else {
                continue;
            };
            if route.target == key {
                targeting.push((id, route));
            } else {
                originating.push((id, route));
            }
        }
        (targeting, originating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neemata_core::WorkerKind;
    use std::time::Duration;

    fn api(id: u32) -> SlotKey {
        SlotKey {
            kind: WorkerKind::Api,
            id,
        }
    }

    fn task(id: u32) -> SlotKey {
        SlotKey {
            kind: WorkerKind::Task,
            id,
        }
    }

    #[test]
    fn test_assign_round_robins_over_runners() {
        let mut router = Router::new();
        router.add_runner(task(0));
        router.add_runner(task(1));

        let deadline = Instant::now() + Duration::from_secs(60);
        let targets: Vec<SlotKey> = (0..4)
            .map(|_| router.assign(Uuid::new_v4(), api(0), deadline).unwrap())
            .collect();
        assert_eq!(targets, vec![task(0), task(1), task(0), task(1)]);
        assert_eq!(router.inflight(), 4);
    }

    #[test]
    fn test_assign_without_runners() {
        let mut router = Router::new();
        assert!(!router.has_runners());
        assert!(
            router
                .assign(Uuid::new_v4(), api(0), Instant::now())
                .is_none()
        );
        assert_eq!(router.inflight(), 0);
    }

    #[test]
    fn test_complete_returns_origin() {
        let mut router = Router::new();
        router.add_runner(task(0));
        let id = Uuid::new_v4();
        let deadline = Instant::now() + Duration::from_secs(60);
        router.assign(id, api(3), deadline).unwrap();

        let route = router.complete(id).unwrap();
        assert_eq!(route.origin, api(3));
        assert_eq!(route.target, task(0));
        assert!(router.complete(id).is_none());
    }

    #[test]
    fn test_expired_routes_are_drained() {
        let mut router = Router::new();
        router.add_runner(task(0));
        let now = Instant::now();

        let stale = Uuid::new_v4();
        router.assign(stale, api(0), now - Duration::from_secs(1));
        let fresh = Uuid::new_v4();
        router.assign(fresh, api(0), now + Duration::from_secs(60));

        let expired = router.expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, stale);
        assert_eq!(router.inflight(), 1);
        assert!(router.expired(now).is_empty());
    }

    #[test]
    fn test_worker_lost_splits_routes() {
        let mut router = Router::new();
        router.add_runner(task(0));
        router.add_runner(task(1));
        let deadline = Instant::now() + Duration::from_secs(60);

        let to_lost = Uuid::new_v4();
        router.assign(to_lost, api(0), deadline); // → task(0)
        let to_alive = Uuid::new_v4();
        router.assign(to_alive, api(0), deadline); // → task(1)

        let (targeting, originating) = router.worker_lost(task(0));
        assert_eq!(targeting.len(), 1);
        assert_eq!(targeting[0].0, to_lost);
        assert!(originating.is_empty());
        assert_eq!(router.inflight(), 1);
        assert!(!router.runners.contains(&task(0)));

        // A lost api worker leaves its targets to be aborted.
        let (targeting, originating) = router.worker_lost(api(0));
        assert!(targeting.is_empty());
        assert_eq!(originating.len(), 1);
        assert_eq!(originating[0].0, to_alive);
        assert_eq!(originating[0].1.target, task(1));
    }
}
