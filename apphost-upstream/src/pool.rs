use std::collections::HashSet;
use std::time::Duration;

use crate::server::Server;

/// The weighted, least-inflight-load pool of backends behind one named upstream (spec §3
/// `Server Pool`, §4.A). Slots are addressed by index rather than compacted on removal so that a
/// server taken out by reconfiguration while a request is in flight against it leaves a `None`
/// hole instead of shifting every other server's index out from under `return_server`.
#[derive(Debug, Clone)]
pub struct ServerPool {
    servers: Vec<Option<Server>>,
    /// Bumped whenever a slot's occupant changes identity (removed or replaced by
    /// reconfiguration), independent of the occupant's own stats so a stats-reporting reset can
    /// never make a stale reactivation timer look fresh again.
    generations: Vec<u64>,
    last_selected_index: usize,
    pub tries: u32,
    pub max_fails: u32,
    pub fail_timeout: Duration,
}

/// What happened when returning a server to the pool: whether it needs a reactivation timer
/// scheduled by the caller (the pool itself does no I/O or spawning).
#[derive(Debug, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// Nothing further to do.
    Ok,
    /// `consecutive_fails` crossed `max_fails`; the caller should schedule reactivation of the
    /// server at this index after `fail_timeout`, guarded by `generation` so a server replaced by
    /// reconfiguration in the meantime isn't resurrected.
    Deactivated { index: usize, generation: u64 },
    /// The slot was already empty (removed by reconfiguration); nothing to return.
    SlotGone,
}

impl ServerPool {
    pub fn new(servers: Vec<Server>, tries: u32, max_fails: u32, fail_timeout: Duration) -> Self {
        let n = servers.len();
        Self {
            servers: servers.into_iter().map(Some).collect(),
            generations: vec![0; n],
            // so the first `borrow` starts scanning at index 0
            last_selected_index: 0,
            tries: tries.max(1),
            max_fails,
            fail_timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.iter().all(Option::is_none)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// The current generation of the occupant at `index`, used to tell a reactivation timer "the
    /// server you were about to restore isn't the one that's there anymore".
    pub fn generation(&self, index: usize) -> u64 {
        self.generations.get(index).copied().unwrap_or(0)
    }

    /// Select the least-loaded active server not already in `tried`, scanning starting AT the
    /// last selected index (so the previous pick is reconsidered first) and breaking load ties in
    /// scan order — first-encountered wins, via a strict `<` replacement (frontik
    /// `Upstream.borrow_server`). Returns `None` when every server is inactive, missing, or
    /// already tried.
    pub fn borrow(&mut self, tried: &HashSet<usize>) -> Option<(usize, String)> {
        let n = self.servers.len();
        if n == 0 {
            return None;
        }

        let mut best: Option<(usize, f64)> = None;
        for offset in 0..n {
            let index = (self.last_selected_index + offset) % n;
            let Some(server) = self.servers[index].as_ref() else {
                continue;
            };
            if !server.is_active || tried.contains(&index) {
                continue;
            }
            let load = server.load();
            match best {
                Some((_, best_load)) if load >= best_load => {}
                _ => best = Some((index, load)),
            }
        }

        let (index, _) = best?;
        let server = self.servers[index].as_mut().expect("checked above");
        server.inflight_requests += 1;
        server.stats_requests += 1;
        self.last_selected_index = index;
        Some((index, server.address.clone()))
    }

    /// Release a server borrowed via `borrow`, recording success or failure. Tolerates the slot
    /// having been emptied by reconfiguration since the borrow.
    pub fn return_server(&mut self, index: usize, error: bool) -> ReturnOutcome {
        let Some(server) = self.servers.get_mut(index).and_then(|s| s.as_mut()) else {
            return ReturnOutcome::SlotGone;
        };

        server.inflight_requests = server.inflight_requests.saturating_sub(1);

        if error {
            server.stats_errors += 1;
            server.consecutive_fails += 1;
            if self.max_fails > 0 && server.consecutive_fails >= self.max_fails {
                server.is_active = false;
                return ReturnOutcome::Deactivated {
                    index,
                    generation: self.generation(index),
                };
            }
        } else {
            server.consecutive_fails = 0;
        }

        ReturnOutcome::Ok
    }

    /// Restore a deactivated server, but only if it's still the same server (same `generation`)
    /// that was deactivated — a reconfiguration in between means this timer is stale and is a
    /// no-op.
    pub fn reactivate(&mut self, index: usize, generation: u64) {
        if let Some(server) = self.servers.get_mut(index).and_then(|s| s.as_mut()) {
            if self.generation(index) == generation {
                server.is_active = true;
                server.consecutive_fails = 0;
            }
        }
    }

    /// Reconfigure the pool in place: servers whose address is still present keep their slot
    /// (and live state), servers no longer present are removed (becoming a `None` hole so
    /// in-flight indices stay valid), and brand-new addresses fill empty holes before being
    /// appended (frontik `Upstream.update`/`_add_server`).
    pub fn reconfigure(&mut self, new_servers: Vec<Server>) {
        let mut incoming: Vec<Option<Server>> = new_servers.into_iter().map(Some).collect();

        for (index, slot) in self.servers.iter_mut().enumerate() {
            let Some(existing) = slot.as_mut() else {
                continue;
            };
            if let Some(pos) = incoming
                .iter()
                .position(|s| s.as_ref().is_some_and(|s| s.address == existing.address))
            {
                let new_server = incoming[pos].take().expect("just matched");
                existing.weight = new_server.weight;
            } else {
                *slot = None;
                self.generations[index] = self.generations[index].wrapping_add(1);
            }
        }

        for leftover in incoming.into_iter().flatten() {
            if let Some(hole_index) = self.servers.iter().position(Option::is_none) {
                self.servers[hole_index] = Some(leftover);
                self.generations[hole_index] = self.generations[hole_index].wrapping_add(1);
            } else {
                self.servers.push(Some(leftover));
                self.generations.push(0);
            }
        }
    }

    /// Snapshot and reset every server's per-interval stats (frontik
    /// `HttpClientFactory.log_stats`): `(address, is_active, stats_requests, stats_errors)`.
    pub fn take_stats(&mut self) -> Vec<(String, bool, u64, u64)> {
        self.servers
            .iter_mut()
            .flatten()
            .map(|s| {
                let (requests, errors) = s.take_stats();
                (s.address.clone(), s.is_active, requests, errors)
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn server(&self, index: usize) -> Option<&Server> {
        self.servers.get(index).and_then(|s| s.as_ref())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pool(weights: &[u32]) -> ServerPool {
        let servers = weights
            .iter()
            .enumerate()
            .map(|(i, &w)| Server::new(format!("host{i}"), w))
            .collect();
        ServerPool::new(servers, 2, 0, Duration::from_secs(10))
    }

    #[test]
    fn weighted_selection_favors_higher_weight() {
        // Four concurrent borrows with no returns in between (spec §8's worked boundary case):
        // A=weight 2, B=weight 1, scan starts at the last pick each time, ties break in scan
        // order. Expected sequence A,B,A,A.
        let mut p = pool(&[2, 1]);
        let mut picks = vec![];
        let tried = HashSet::new();
        for _ in 0..4 {
            let (idx, _) = p.borrow(&tried).unwrap();
            picks.push(idx);
        }
        assert_eq!(picks, vec![0, 1, 0, 0]);
        assert_eq!(p.server(0).unwrap().inflight_requests, 3);
        assert_eq!(p.server(1).unwrap().inflight_requests, 1);
    }

    #[test]
    fn weighted_selection_gives_more_share_as_load_grows() {
        // Once A (weight 2) is returned between rounds while B (weight 1) stays pinned, A should
        // be preferred again since its load-per-weight recovers faster.
        let mut p = pool(&[2, 1]);
        let tried = HashSet::new();
        let (a1, _) = p.borrow(&tried).unwrap();
        let (_b1, _) = p.borrow(&tried).unwrap();
        p.return_server(a1, false);
        let (next, _) = p.borrow(&tried).unwrap();
        assert_eq!(next, 0, "A should be rescheduled once its load drops below B's");
    }

    #[test]
    fn single_server_pool_tries_three_goes_inactive() {
        let mut p = ServerPool::new(
            vec![Server::new("only", 1)],
            3,
            3,
            Duration::from_secs(10),
        );
        let mut tried = HashSet::new();
        for _ in 0..3 {
            let (idx, _) = p.borrow(&tried).unwrap();
            let outcome = p.return_server(idx, true);
            if p.server(idx).unwrap().consecutive_fails >= 3 {
                assert_eq!(
                    outcome,
                    ReturnOutcome::Deactivated {
                        index: idx,
                        generation: p.generation(idx)
                    }
                );
            }
            tried.clear();
        }
        assert!(!p.server(0).unwrap().is_active);
        assert!(p.borrow(&tried).is_none());
    }

    #[test]
    fn return_server_tolerates_reconfigured_away_slot() {
        let mut p = pool(&[1, 1]);
        let mut tried = HashSet::new();
        let (idx, _) = p.borrow(&tried).unwrap();
        tried.clear();
        p.reconfigure(vec![Server::new("replacement", 1)]);
        // whichever slot idx pointed at may now be empty or replaced; either way this must not
        // panic
        let _ = p.return_server(idx, false);
    }

    #[test]
    fn reconfigure_preserves_slot_for_surviving_address() {
        let mut p = pool(&[1, 1]);
        p.reconfigure(vec![
            Server::new("host0", 5),
            Server::new("host2", 1),
        ]);
        assert_eq!(p.server(0).unwrap().weight, 5);
        assert!(p.server(1).is_none() || p.server(1).unwrap().address == "host2");
    }

    #[test]
    fn exhausted_tried_set_yields_none() {
        let mut p = pool(&[1, 1]);
        let mut tried = HashSet::new();
        tried.insert(0);
        tried.insert(1);
        assert!(p.borrow(&tried).is_none());
    }
}
