//! The speaker's tables: sources, routes and pending seqno requests
//! (RFC 8966, sections 3.2.5-3.2.7), plus the feasibility condition
//! (section 3.5.1).

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use babel_proto::{
    metric_add, seqno_less, Metric, RouterId, SequenceNumber, INFINITY,
};

use crate::config::RouteInfo;
use crate::neighbour::Neighbour;

/// The feasibility distance recorded for a (prefix, router-id) pair: the
/// best (seqno, metric) this speaker has accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FeasibilityDistance {
    pub seqno: SequenceNumber,
    pub metric: Metric,
}

impl FeasibilityDistance {
    /// Whether this distance is strictly better than `other`: newer seqno,
    /// or same seqno and smaller metric.
    pub fn is_better_than(&self, other: FeasibilityDistance) -> bool {
        seqno_less(other.seqno, self.seqno)
            || (self.seqno == other.seqno && self.metric < other.metric)
    }
}

/// Whether an update carrying `(seqno, metric)` is feasible against the
/// recorded source distance. Retractions are always feasible; so is
/// anything for which no source entry exists.
pub(crate) fn update_is_feasible(
    source: Option<FeasibilityDistance>,
    seqno: SequenceNumber,
    metric: Metric,
) -> bool {
    if metric == INFINITY {
        return true;
    }
    match source {
        None => true,
        Some(src) => FeasibilityDistance { seqno, metric }.is_better_than(src),
    }
}

/// One source table entry, garbage collected when not refreshed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SourceEntry {
    pub distance: FeasibilityDistance,
    pub refreshed_at: Instant,
}

/// One route table entry. The table is keyed by prefix; within a prefix at
/// most one entry exists per neighbour.
#[derive(Clone)]
pub(crate) struct RouteEntry {
    pub neighbour: Arc<Neighbour>,
    pub router_id: RouterId,
    pub next_hop: IpAddr,
    pub seqno: SequenceNumber,
    /// The advertised metric, before the link cost is added.
    pub metric: Metric,
    /// Exponentially smoothed advertised metric, used to dampen route
    /// flapping on metric increases.
    pub smoothed_metric: Metric,
    /// Whether the last accepted update was feasible. Only feasible routes
    /// may be selected.
    pub feasible: bool,
    pub selected: bool,
    pub expires_at: Instant,
}

impl RouteEntry {
    /// The metric of this route via its neighbour; infinity is absorbing.
    pub fn effective_metric(&self) -> Metric {
        metric_add(self.metric, self.neighbour.cost())
    }

    pub fn effective_smoothed_metric(&self) -> Metric {
        metric_add(self.smoothed_metric, self.neighbour.cost())
    }

    /// Updates the advertised metric, folding it into the smoothed metric.
    /// A retraction is absorbed immediately.
    pub fn set_metric(&mut self, metric: Metric, alpha: f64) {
        if metric == INFINITY || self.smoothed_metric == INFINITY {
            self.smoothed_metric = metric;
        } else {
            let smoothed =
                alpha * f64::from(self.smoothed_metric) + (1.0 - alpha) * f64::from(metric);
            self.smoothed_metric = smoothed.round() as Metric;
        }
        self.metric = metric;
    }

    pub fn info(&self, prefix: IpNetwork) -> RouteInfo {
        RouteInfo {
            prefix,
            router_id: self.router_id,
            neighbour: self.neighbour.info(),
            next_hop: self.next_hop,
            seqno: self.seqno,
            metric: self.metric,
            selected: self.selected,
        }
    }
}

/// A pending seqno request (RFC 8966, section 3.2.7), resent a bounded
/// number of times.
pub(crate) struct PendingSeqnoRequest {
    pub seqno: SequenceNumber,
    pub hop_count: u8,
    /// The neighbour the request was sent towards; resends go there too.
    /// `None` broadcasts on every interface.
    pub target: Option<std::sync::Weak<Neighbour>>,
    pub resent: u8,
    pub next_resend: Instant,
}

/// The speaker-wide tables, guarded by a single lock so a selection pass
/// observes a consistent snapshot.
#[derive(Default)]
pub(crate) struct Tables {
    pub routes: FxHashMap<IpNetwork, Vec<RouteEntry>>,
    pub sources: FxHashMap<(IpNetwork, RouterId), SourceEntry>,
    pub pending_seqno: FxHashMap<(IpNetwork, RouterId), PendingSeqnoRequest>,
}

impl Tables {
    pub fn source_distance(
        &self,
        prefix: IpNetwork,
        router_id: RouterId,
    ) -> Option<FeasibilityDistance> {
        self.sources.get(&(prefix, router_id)).map(|s| s.distance)
    }

    /// Creates or improves the source entry for an accepted update and
    /// refreshes its garbage-collection clock.
    pub fn refresh_source(
        &mut self,
        prefix: IpNetwork,
        router_id: RouterId,
        distance: FeasibilityDistance,
        now: Instant,
    ) {
        self.sources
            .entry((prefix, router_id))
            .and_modify(|s| {
                if distance.is_better_than(s.distance) {
                    s.distance = distance;
                }
                s.refreshed_at = now;
            })
            .or_insert(SourceEntry { distance, refreshed_at: now });
    }

    pub fn route_mut(
        &mut self,
        prefix: IpNetwork,
        neighbour: &Neighbour,
    ) -> Option<&mut RouteEntry> {
        self.routes
            .get_mut(&prefix)?
            .iter_mut()
            .find(|r| r.neighbour.key() == neighbour.key())
    }

    pub fn selected_route(&self, prefix: IpNetwork) -> Option<&RouteEntry> {
        self.routes.get(&prefix)?.iter().find(|r| r.selected)
    }

    /// Drops every route learnt via `neighbour`, returning the identity of
    /// each selected route that was lost.
    pub fn remove_neighbour_routes(
        &mut self,
        neighbour: &Neighbour,
    ) -> Vec<(IpNetwork, RouterId, SequenceNumber)> {
        let key = neighbour.key();
        let mut lost = Vec::new();
        self.routes.retain(|prefix, entries| {
            entries.retain(|r| {
                if r.neighbour.key() == key {
                    if r.selected {
                        lost.push((*prefix, r.router_id, r.seqno));
                    }
                    false
                } else {
                    true
                }
            });
            !entries.is_empty()
        });
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd(seqno: SequenceNumber, metric: Metric) -> FeasibilityDistance {
        FeasibilityDistance { seqno, metric }
    }

    #[test]
    fn feasibility_against_a_source_entry() {
        let src = Some(fd(10, 50));
        assert!(!update_is_feasible(src, 10, 50));
        assert!(update_is_feasible(src, 10, 49));
        assert!(update_is_feasible(src, 11, 60));
        assert!(!update_is_feasible(src, 9, 10));
    }

    #[test]
    fn retractions_are_always_feasible() {
        assert!(update_is_feasible(Some(fd(10, 50)), 9, INFINITY));
    }

    #[test]
    fn no_source_entry_means_feasible() {
        assert!(update_is_feasible(None, 0, 1000));
    }

    #[test]
    fn distance_ordering() {
        assert!(fd(11, 60).is_better_than(fd(10, 50)));
        assert!(fd(10, 49).is_better_than(fd(10, 50)));
        assert!(!fd(10, 50).is_better_than(fd(10, 50)));
        assert!(!fd(9, 1).is_better_than(fd(10, 50)));
        // Circular comparison near the wrap point.
        assert!(fd(0x0000, 50).is_better_than(fd(0xffff, 50)));
    }
}
