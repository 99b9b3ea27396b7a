//! The speaker: socket ingress, TLV dispatch, the authoritative tables and
//! route selection (RFC 8966, sections 3.5-3.8).

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddrV6};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ipnetwork::IpNetwork;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use babel_proto as proto;
use babel_proto::{
    compression_order, is_babel_packet, seqno_less, Metric, RouterId, RouterIdTlv,
    SequenceNumber, Value, HEADER_LEN, INFINITY, PORT,
};

use crate::config::{RouteInfo, SpeakerConfig};
use crate::interface::Interface;
use crate::neighbour::Neighbour;
use crate::net::{list_links, BabelSocket};
use crate::route::{
    update_is_feasible, FeasibilityDistance, PendingSeqnoRequest, RouteEntry, Tables,
};
use crate::Error;

/// Up to this many neighbours, urgent updates go out per neighbour with an
/// acknowledgment request instead of over multicast.
const PARTIAL_UPDATE_ACK_THRESHOLD: usize = 4;
/// Hop count put on originated seqno requests.
const SEQNO_REQUEST_HOP_COUNT: u8 = 64;
/// How often seqno requests and acknowledged updates are re-sent before
/// giving up.
const MAX_RESENDS: u8 = 3;
/// Cadence of the expiry / garbage-collection sweep.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

const MAX_DATAGRAM: usize = 65535;

/// A tracked outbound acknowledgment request. The timer task re-sends the
/// values on timeout.
struct PendingAck {
    cancel: CancellationToken,
}

pub(crate) struct Core {
    pub(crate) config: SpeakerConfig,
    pub(crate) router_id: RouterId,
    pub(crate) socket: Arc<BabelSocket>,
    pub(crate) interfaces: RwLock<FxHashMap<u32, Arc<Interface>>>,
    pub(crate) tables: RwLock<Tables>,
    pending_acks: Mutex<FxHashMap<u16, PendingAck>>,
    pub(crate) cancel: CancellationToken,
    read_error: Mutex<Option<io::Error>>,
}

/// A Babel speaker: one per process. Owns the UDP socket, all tables and
/// the per-interface and per-neighbour tasks.
pub struct Speaker {
    core: Arc<Core>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Speaker {
    /// Binds the socket, enumerates interfaces and starts the event loop.
    pub async fn new(config: SpeakerConfig) -> Result<Speaker, Error> {
        config.validate()?;

        let router_id = match config.router_id {
            Some(rid) => rid,
            None => {
                let rid = RouterId::random();
                info!(router_id = %rid, "generated random router-id");
                rid
            }
        };

        let socket = Arc::new(BabelSocket::open(PORT)?);

        let core = Arc::new(Core {
            config,
            router_id,
            socket,
            interfaces: RwLock::new(FxHashMap::default()),
            tables: RwLock::new(Tables::default()),
            pending_acks: Mutex::new(FxHashMap::default()),
            cancel: CancellationToken::new(),
            read_error: Mutex::new(None),
        });

        for link in list_links()? {
            if link.loopback || !link.up {
                continue;
            }
            if let Some(filter) = &core.config.interface_filter {
                if !filter(&link.name) {
                    continue;
                }
            }

            match Interface::create(&core, &link) {
                Ok(intf) => {
                    info!(interface = %link.name, index = link.index, mtu = link.mtu, "bound interface");
                    core.interfaces.write().unwrap().insert(link.index, Arc::clone(&intf));
                    if let Some(handler) = &core.config.handler {
                        handler.interface_added(&intf.info());
                    }
                }
                Err(e) => {
                    warn!(interface = %link.name, error = %e, "failed to bind interface");
                }
            }
        }

        for peer in core.config.unicast_peers.clone() {
            let intf = core.interfaces.read().unwrap().get(&peer.scope_id()).cloned();
            match intf {
                Some(intf) => {
                    intf.find_or_create_neighbour(&core, *peer.ip());
                }
                None => warn!(peer = %peer, "no bound interface for unicast peer"),
            }
        }

        let tasks = vec![
            tokio::spawn(run_ingress(Arc::clone(&core))),
            tokio::spawn(run_housekeeping(Arc::clone(&core))),
        ];

        Ok(Speaker { core, tasks: Mutex::new(tasks) })
    }

    pub fn router_id(&self) -> RouterId {
        self.core.router_id
    }

    /// A snapshot of the route table.
    pub fn routes(&self) -> Vec<RouteInfo> {
        let tables = self.core.tables.read().unwrap();
        tables
            .routes
            .iter()
            .flat_map(|(prefix, entries)| entries.iter().map(|r| r.info(*prefix)))
            .collect()
    }

    /// Shuts the speaker down: cancels the ingress task, closes every send
    /// queue (draining in-flight flushes) and stops all timers. Returns the
    /// terminal socket error, if the read loop died on one.
    pub async fn close(self) -> Result<(), Error> {
        self.core.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let interfaces: Vec<_> =
            self.core.interfaces.write().unwrap().drain().map(|(_, i)| i).collect();
        for intf in interfaces {
            intf.close().await;
            if let Some(handler) = &self.core.config.handler {
                handler.interface_removed(&intf.info());
            }
        }

        if let Some(e) = self.core.read_error.lock().unwrap().take() {
            return Err(Error::Io(e));
        }
        Ok(())
    }
}

// Ingress

/// Why a datagram was silently dropped before parsing.
pub(crate) fn ingress_drop_reason(src: &SocketAddrV6, data: &[u8]) -> Option<&'static str> {
    if (src.ip().segments()[0] & 0xffc0) != 0xfe80 {
        return Some("source address is not link-local");
    }
    if src.port() != PORT {
        return Some("source port is not the babel port");
    }
    if data.len() < HEADER_LEN {
        return Some("packet too short");
    }
    if !is_babel_packet(data) {
        return Some("bad magic");
    }
    None
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

async fn run_ingress(core: Arc<Core>) {
    debug!("start receiving packets");
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let dgram = tokio::select! {
            _ = core.cancel.cancelled() => return,
            r = core.socket.recv(&mut buf) => match r {
                Ok(d) => d,
                Err(e) if is_transient(&e) => {
                    debug!(error = %e, "transient socket error");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "socket read failed, terminating");
                    *core.read_error.lock().unwrap() = Some(e);
                    core.cancel.cancel();
                    return;
                }
            },
        };

        let data = &buf[..dgram.len];
        if let Some(reason) = ingress_drop_reason(&dgram.src, data) {
            trace!(src = %dgram.src, reason, "ignoring datagram");
            continue;
        }

        let intf = core.interfaces.read().unwrap().get(&dgram.ifindex).cloned();
        let Some(intf) = intf else {
            debug!(ifindex = dgram.ifindex, "ignoring packet from unknown interface");
            continue;
        };

        intf.on_datagram(&core, dgram.src, data);
    }
}

// Route acquisition (RFC 8966, section 3.5.3)

#[derive(Debug, Default, PartialEq)]
pub(crate) struct UpdateOutcome {
    pub accepted: bool,
    /// Ask the advertising neighbour for a fresh seqno: an infeasible
    /// update hit the selected route (section 3.8.2.2).
    pub send_seqno_request: Option<(RouterId, SequenceNumber)>,
    /// The prefix should be advertised urgently (router-id change, or a
    /// pending seqno request was satisfied).
    pub urgent: bool,
}

pub(crate) fn apply_update(
    tables: &mut Tables,
    alpha: f64,
    route_expiry: Duration,
    neighbour: &Arc<Neighbour>,
    u: &proto::Update,
    metric: Metric,
    now: Instant,
) -> UpdateOutcome {
    let prefix = u.prefix;
    let rid = u.router_id;
    let mut out = UpdateOutcome::default();

    // An update without a preceding Next Hop TLV routes via the sender.
    let next_hop = if u.next_hop.is_unspecified() {
        IpAddr::V6(neighbour.address())
    } else {
        u.next_hop
    };

    let feasible = update_is_feasible(tables.source_distance(prefix, rid), u.seqno, metric);

    if tables.route_mut(prefix, neighbour).is_none() {
        if metric == INFINITY || !feasible {
            return out;
        }
        tables.routes.entry(prefix).or_default().push(RouteEntry {
            neighbour: Arc::clone(neighbour),
            router_id: rid,
            next_hop,
            seqno: u.seqno,
            metric,
            smoothed_metric: metric,
            feasible: true,
            selected: false,
            expires_at: now + route_expiry,
        });
        tables.refresh_source(prefix, rid, FeasibilityDistance { seqno: u.seqno, metric }, now);
        out.accepted = true;
    } else {
        let route = tables.route_mut(prefix, neighbour).unwrap();

        // A selected route MAY ignore an infeasible update that keeps the
        // same router-id (section 3.5.3).
        if route.selected && !feasible && rid == route.router_id {
            return out;
        }

        let rid_changed = rid != route.router_id;
        let was_selected = route.selected;

        route.seqno = u.seqno;
        route.router_id = rid;
        route.next_hop = next_hop;
        route.feasible = feasible;
        route.set_metric(metric, alpha);
        if metric != INFINITY {
            route.expires_at = now + route_expiry;
        }
        if !feasible && was_selected {
            route.selected = false;
        }

        if !feasible {
            if was_selected {
                // Section 3.8.2.2: solicit a newer seqno from the
                // advertising neighbour.
                let req_seqno = tables
                    .source_distance(prefix, rid)
                    .map(|d| d.seqno.wrapping_add(1))
                    .unwrap_or_else(|| u.seqno.wrapping_add(1));
                out.send_seqno_request = Some((rid, req_seqno));
            }
        } else if metric != INFINITY {
            tables.refresh_source(prefix, rid, FeasibilityDistance { seqno: u.seqno, metric }, now);
        }

        if rid_changed {
            out.urgent = true;
        }
        out.accepted = true;
    }

    // A sufficiently new accepted update satisfies a pending seqno request.
    let satisfied = tables
        .pending_seqno
        .get(&(prefix, rid))
        .is_some_and(|pending| metric != INFINITY && !seqno_less(u.seqno, pending.seqno));
    if satisfied {
        tables.pending_seqno.remove(&(prefix, rid));
        out.urgent = true;
    }

    out
}

// Route selection (RFC 8966, section 3.6)

pub(crate) enum SelectionChange {
    /// A different route became selected; advertise it.
    Selected(proto::Update),
    /// The prefix lost its selected route; advertise the retraction.
    Retracted(proto::Update),
}

fn advert_for(prefix: IpNetwork, r: &RouteEntry, interval: Duration) -> proto::Update {
    proto::Update {
        flags: 0,
        interval,
        seqno: r.seqno,
        metric: r.effective_metric(),
        prefix,
        router_id: r.router_id,
        next_hop: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        source_prefix: None,
    }
}

fn retraction_for(
    prefix: IpNetwork,
    router_id: RouterId,
    seqno: SequenceNumber,
    interval: Duration,
) -> proto::Update {
    proto::Update {
        flags: 0,
        interval,
        seqno,
        metric: INFINITY,
        prefix,
        router_id,
        next_hop: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        source_prefix: None,
    }
}

/// Re-runs route selection for one prefix. The best feasible, non-retracted
/// route by effective metric wins, with a sticky preference for the
/// previously selected route: a challenger must also beat it on the
/// smoothed metric, which dampens flapping when metrics increase.
pub(crate) fn select_prefix(
    tables: &mut Tables,
    prefix: IpNetwork,
    update_interval: Duration,
) -> Option<SelectionChange> {
    let entries = tables.routes.get(&prefix)?;

    let candidate = |r: &RouteEntry| {
        r.feasible && r.metric != INFINITY && r.effective_metric() != INFINITY
    };

    let prev = entries.iter().position(|r| r.selected);

    let mut best: Option<usize> = None;
    for (i, r) in entries.iter().enumerate() {
        if !candidate(r) {
            continue;
        }
        best = match best {
            None => Some(i),
            Some(b) => {
                let cur = &entries[b];
                let better = (r.effective_metric(), r.router_id, r.neighbour.key())
                    < (cur.effective_metric(), cur.router_id, cur.neighbour.key());
                if better {
                    Some(i)
                } else {
                    Some(b)
                }
            }
        };
    }

    // Hysteresis: keep the current selection unless the challenger also
    // wins on the smoothed metric.
    if let (Some(p), Some(b)) = (prev, best) {
        if p != b
            && candidate(&entries[p])
            && entries[b].effective_smoothed_metric() >= entries[p].effective_smoothed_metric()
        {
            best = Some(p);
        }
    }

    match (prev, best) {
        (prev, Some(b)) => {
            let changed = prev != Some(b);
            let entries = tables.routes.get_mut(&prefix).unwrap();
            for (i, r) in entries.iter_mut().enumerate() {
                r.selected = i == b;
            }
            changed.then(|| SelectionChange::Selected(advert_for(prefix, &entries[b], update_interval)))
        }
        (Some(p), None) => {
            let entries = tables.routes.get_mut(&prefix).unwrap();
            let advert = retraction_for(
                prefix,
                entries[p].router_id,
                entries[p].seqno,
                update_interval,
            );
            for r in entries.iter_mut() {
                r.selected = false;
            }
            Some(SelectionChange::Retracted(advert))
        }
        (None, None) => None,
    }
}

impl Core {
    // TLV handlers, called from the neighbour dispatch.

    pub(crate) fn on_update(self: &Arc<Self>, neighbour: &Arc<Neighbour>, u: proto::Update) {
        if u.metric != INFINITY && !u.router_id.is_valid() {
            debug!(prefix = %u.prefix, "ignoring update without a valid router-id");
            return;
        }

        let metric = match &self.config.route_filter {
            Some(filter) => filter(&RouteInfo {
                prefix: u.prefix,
                router_id: u.router_id,
                neighbour: neighbour.info(),
                next_hop: u.next_hop,
                seqno: u.seqno,
                metric: u.metric,
                selected: false,
            }),
            None => u.metric,
        };
        if metric == INFINITY && u.metric != INFINITY {
            trace!(prefix = %u.prefix, "route rejected by filter");
            return;
        }

        let p = &self.config.parameters;
        let outcome = {
            let mut tables = self.tables.write().unwrap();
            apply_update(
                &mut tables,
                p.metric_smoothing_alpha,
                p.route_expiry_time,
                neighbour,
                &u,
                metric,
                Instant::now(),
            )
        };

        if let Some((rid, seqno)) = outcome.send_seqno_request {
            self.send_seqno_request_to(neighbour, u.prefix, rid, seqno);
        }

        self.reselect_prefix(u.prefix, outcome.urgent);
    }

    pub(crate) fn on_route_request(self: &Arc<Self>, neighbour: &Arc<Neighbour>, req: &proto::RouteRequest) {
        let p = &self.config.parameters;

        if req.is_wildcard() {
            let updates = self.selected_updates();
            if !updates.is_empty() {
                neighbour.send_values(self.build_update_values(updates), p.urgent_timeout);
            }
            return;
        }

        let advert = {
            let tables = self.tables.read().unwrap();
            match tables.selected_route(req.prefix) {
                Some(r) => advert_for(req.prefix, r, p.update_interval),
                // No route: answer with a retraction in our own name.
                None => retraction_for(req.prefix, self.router_id, 0, p.update_interval),
            }
        };
        neighbour.send_values(self.build_update_values(vec![advert]), p.urgent_timeout);
    }

    pub(crate) fn on_seqno_request(self: &Arc<Self>, neighbour: &Arc<Neighbour>, req: &proto::SeqnoRequest) {
        if req.hop_count == 0 {
            return;
        }
        let p = &self.config.parameters;

        let mut tables = self.tables.write().unwrap();
        let selected = tables
            .selected_route(req.prefix)
            .map(|r| (r.router_id, r.seqno, Arc::clone(&r.neighbour), advert_for(req.prefix, r, p.update_interval)));

        match selected {
            // Our selected route already satisfies the request, or has
            // moved to a different originator: answer with it.
            Some((rid, seqno, _, advert))
                if rid != req.router_id || !seqno_less(seqno, req.seqno) =>
            {
                drop(tables);
                neighbour.send_values(self.build_update_values(vec![advert]), p.urgent_timeout);
            }
            // Forward towards the selected neighbour, once per seqno.
            Some((_, _, target, _)) if req.hop_count >= 2 && target.key() != neighbour.key() => {
                let key = (req.prefix, req.router_id);
                let dup = tables
                    .pending_seqno
                    .get(&key)
                    .is_some_and(|pending| !seqno_less(pending.seqno, req.seqno));
                if dup {
                    return;
                }
                tables.pending_seqno.insert(
                    key,
                    PendingSeqnoRequest {
                        seqno: req.seqno,
                        hop_count: req.hop_count - 1,
                        target: Some(Arc::downgrade(&target)),
                        resent: 0,
                        next_resend: Instant::now() + p.initial_request_timeout,
                    },
                );
                drop(tables);

                let mut fwd = *req;
                fwd.hop_count -= 1;
                trace!(prefix = %fwd.prefix, "forwarding seqno request");
                target.send_values([Value::SeqnoRequest(fwd)], p.urgent_timeout);
            }
            _ => {}
        }
    }

    pub(crate) fn on_acknowledgment(self: &Arc<Self>, neighbour: &Arc<Neighbour>, ack: &proto::Acknowledgment) {
        match self.pending_acks.lock().unwrap().remove(&ack.opaque) {
            Some(pending) => {
                trace!(neighbour = %neighbour.address(), opaque = ack.opaque, "acknowledged");
                pending.cancel.cancel();
            }
            None => {
                debug!(neighbour = %neighbour.address(), opaque = ack.opaque, "unexpected acknowledgment");
            }
        }
    }

    // Triggered and periodic updates

    /// One Update TLV per selected route.
    fn selected_updates(&self) -> Vec<proto::Update> {
        let interval = self.config.parameters.update_interval;
        let tables = self.tables.read().unwrap();
        tables
            .routes
            .iter()
            .filter_map(|(prefix, entries)| {
                entries.iter().find(|r| r.selected).map(|r| advert_for(*prefix, r, interval))
            })
            .collect()
    }

    /// Sorts updates for compression and interleaves the Router-Id TLVs
    /// they depend on. Every update carries the prefix flag so consecutive
    /// prefixes compress against each other.
    pub(crate) fn build_update_values(&self, mut updates: Vec<proto::Update>) -> Vec<Value> {
        updates.sort_by(compression_order);

        let mut values = Vec::with_capacity(updates.len() + 2);
        let mut current_rid: Option<RouterId> = None;
        for mut u in updates {
            if u.router_id.is_valid() && current_rid != Some(u.router_id) {
                values.push(Value::RouterId(RouterIdTlv { router_id: u.router_id }));
                current_rid = Some(u.router_id);
            }
            u.flags |= proto::FLAG_UPDATE_PREFIX;
            values.push(Value::Update(u));
        }
        values
    }

    /// The periodic full update for one interface (RFC 8966, section 3.7.1).
    pub(crate) fn send_full_update(self: &Arc<Self>, intf: &Arc<Interface>) {
        let updates = self.selected_updates();
        if updates.is_empty() {
            return;
        }
        let values = self.build_update_values(updates);
        intf.send_values(values, self.config.parameters.multicast_hello_interval / 2);
    }

    /// Sends an urgent (triggered) update or retraction to everyone.
    /// With few neighbours it goes per neighbour under an acknowledgment
    /// request so losses are repaired quickly.
    fn send_urgent_values(self: &Arc<Self>, values: Vec<Value>) {
        let neighbours: Vec<_> = {
            let interfaces = self.interfaces.read().unwrap();
            interfaces.values().flat_map(|i| i.neighbours()).collect()
        };

        if neighbours.is_empty() || neighbours.len() > PARTIAL_UPDATE_ACK_THRESHOLD {
            let interfaces = self.interfaces.read().unwrap();
            for intf in interfaces.values() {
                intf.send_values(values.clone(), self.config.parameters.urgent_timeout);
            }
        } else {
            for n in neighbours {
                self.send_with_ack_request(&n, values.clone(), 0);
            }
        }
    }

    /// Sends values under an acknowledgment request, re-sending on timeout
    /// up to the resend budget.
    fn send_with_ack_request(self: &Arc<Self>, neighbour: &Arc<Neighbour>, values: Vec<Value>, attempt: u8) {
        let interval = self.config.parameters.urgent_timeout;

        let opaque = {
            let mut pending = self.pending_acks.lock().unwrap();
            let opaque = loop {
                let opaque: u16 = rand::random();
                if !pending.contains_key(&opaque) {
                    break opaque;
                }
            };
            pending.insert(opaque, PendingAck { cancel: self.cancel.child_token() });
            opaque
        };

        let mut vs = Vec::with_capacity(values.len() + 1);
        vs.push(Value::AcknowledgmentRequest(proto::AcknowledgmentRequest { opaque, interval }));
        vs.extend(values.iter().cloned());
        neighbour.send_values(vs, interval / 2);

        let core = Arc::clone(self);
        let neighbour = Arc::downgrade(neighbour);
        tokio::spawn(async move {
            let cancel = {
                let pending = core.pending_acks.lock().unwrap();
                match pending.get(&opaque) {
                    Some(p) => p.cancel.clone(),
                    None => return,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = time::sleep(interval * 2) => {
                    if core.pending_acks.lock().unwrap().remove(&opaque).is_none() {
                        return;
                    }
                    let Some(n) = neighbour.upgrade() else { return };
                    if attempt < MAX_RESENDS {
                        debug!(neighbour = %n.address(), attempt, "acknowledgment timed out, re-sending");
                        core.send_with_ack_request(&n, values, attempt + 1);
                    } else {
                        warn!(neighbour = %n.address(), "giving up on acknowledged update");
                    }
                }
            }
        });
    }

    // Selection entry points

    /// Re-runs selection for one prefix and advertises the change. With
    /// `force_urgent`, the current selection is advertised even when it did
    /// not change (router-id change, satisfied seqno request).
    fn reselect_prefix(self: &Arc<Self>, prefix: IpNetwork, force_urgent: bool) {
        let p = &self.config.parameters;
        let (change, unchanged_advert) = {
            let mut tables = self.tables.write().unwrap();
            let change = select_prefix(&mut tables, prefix, p.update_interval);
            let unchanged = if force_urgent && change.is_none() {
                tables.selected_route(prefix).map(|r| advert_for(prefix, r, p.update_interval))
            } else {
                None
            };
            (change, unchanged)
        };

        if let Some(advert) = unchanged_advert {
            self.send_urgent_values(self.build_update_values(vec![advert]));
        }
        self.act_on(prefix, change);
    }

    /// Re-runs selection for every prefix; used after link cost changes.
    pub(crate) fn reselect_all(self: &Arc<Self>) {
        let p = &self.config.parameters;
        let changes: Vec<_> = {
            let mut tables = self.tables.write().unwrap();
            let prefixes: Vec<_> = tables.routes.keys().copied().collect();
            prefixes
                .into_iter()
                .filter_map(|prefix| {
                    select_prefix(&mut tables, prefix, p.update_interval)
                        .map(|c| (prefix, c))
                })
                .collect()
        };

        for (prefix, change) in changes {
            self.act_on(prefix, Some(change));
        }
    }

    fn act_on(self: &Arc<Self>, prefix: IpNetwork, change: Option<SelectionChange>) {
        match change {
            Some(SelectionChange::Selected(advert)) => {
                debug!(prefix = %prefix, metric = advert.metric, "route selection changed");
                self.send_urgent_values(self.build_update_values(vec![advert]));
            }
            Some(SelectionChange::Retracted(advert)) => {
                debug!(prefix = %prefix, "selected route lost, retracting");
                let router_id = advert.router_id;
                let seqno = advert.seqno.wrapping_add(1);
                self.send_urgent_values(self.build_update_values(vec![advert]));
                // Starvation (section 3.8.2.1): ask the network for a newer
                // seqno so the prefix can become feasible again.
                if router_id.is_valid() {
                    self.broadcast_seqno_request(prefix, router_id, seqno);
                }
            }
            None => {}
        }
    }

    // Seqno requests (RFC 8966, section 3.8.2)

    fn send_seqno_request_to(
        self: &Arc<Self>,
        neighbour: &Arc<Neighbour>,
        prefix: IpNetwork,
        router_id: RouterId,
        seqno: SequenceNumber,
    ) {
        let p = &self.config.parameters;
        {
            let mut tables = self.tables.write().unwrap();
            let key = (prefix, router_id);
            if tables
                .pending_seqno
                .get(&key)
                .is_some_and(|pending| !seqno_less(pending.seqno, seqno))
            {
                return;
            }
            tables.pending_seqno.insert(
                key,
                PendingSeqnoRequest {
                    seqno,
                    hop_count: SEQNO_REQUEST_HOP_COUNT,
                    target: Some(Arc::downgrade(neighbour)),
                    resent: 0,
                    next_resend: Instant::now() + p.initial_request_timeout,
                },
            );
        }

        debug!(prefix = %prefix, seqno, "requesting new seqno");
        neighbour.send_values(
            [Value::SeqnoRequest(proto::SeqnoRequest {
                seqno,
                hop_count: SEQNO_REQUEST_HOP_COUNT,
                router_id,
                prefix,
                source_prefix: None,
            })],
            p.urgent_timeout,
        );
    }

    fn broadcast_seqno_request(
        self: &Arc<Self>,
        prefix: IpNetwork,
        router_id: RouterId,
        seqno: SequenceNumber,
    ) {
        let p = &self.config.parameters;
        {
            let mut tables = self.tables.write().unwrap();
            let key = (prefix, router_id);
            if tables
                .pending_seqno
                .get(&key)
                .is_some_and(|pending| !seqno_less(pending.seqno, seqno))
            {
                return;
            }
            tables.pending_seqno.insert(
                key,
                PendingSeqnoRequest {
                    seqno,
                    hop_count: SEQNO_REQUEST_HOP_COUNT,
                    target: None,
                    resent: 0,
                    next_resend: Instant::now() + p.initial_request_timeout,
                },
            );
        }

        let req = Value::SeqnoRequest(proto::SeqnoRequest {
            seqno,
            hop_count: SEQNO_REQUEST_HOP_COUNT,
            router_id,
            prefix,
            source_prefix: None,
        });
        let interfaces = self.interfaces.read().unwrap();
        for intf in interfaces.values() {
            intf.send_values(vec![req.clone()], p.urgent_timeout);
        }
    }

    // Neighbour lifecycle

    /// Removes a dead neighbour off the event path: drops its routes,
    /// retracts what it carried and fires the observer callback.
    pub(crate) fn schedule_neighbour_removal(self: &Arc<Self>, key: (u32, Ipv6Addr)) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let intf = core.interfaces.read().unwrap().get(&key.0).cloned();
            let Some(intf) = intf else { return };
            let Some(neighbour) = intf.remove_neighbour(key.1) else { return };

            info!(neighbour = %neighbour.address(), interface = %intf.name(), "neighbour lost");

            let lost = {
                let mut tables = core.tables.write().unwrap();
                tables.remove_neighbour_routes(&neighbour)
            };

            neighbour.close().await;

            if let Some(handler) = &core.config.handler {
                handler.neighbour_removed(&neighbour.info());
            }

            // Prefixes that still have other routes re-select; the rest are
            // retracted.
            core.reselect_all();
            let p = &core.config.parameters;
            let orphaned: Vec<_> = {
                let tables = core.tables.read().unwrap();
                lost.into_iter()
                    .filter(|(prefix, _, _)| !tables.routes.contains_key(prefix))
                    .map(|(prefix, rid, seqno)| retraction_for(prefix, rid, seqno, p.update_interval))
                    .collect()
            };
            if !orphaned.is_empty() {
                core.send_urgent_values(core.build_update_values(orphaned));
            }
        });
    }
}

// Housekeeping: route expiry, source GC, request resends.

async fn run_housekeeping(core: Arc<Core>) {
    let mut tick = time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        let now = Instant::now();
        let p = core.config.parameters.clone();
        let mut resends = Vec::new();

        {
            let mut tables = core.tables.write().unwrap();

            // Expire stale routes into retractions; drop entries that have
            // been retracted for a whole expiry period.
            for entries in tables.routes.values_mut() {
                for r in entries.iter_mut() {
                    if r.metric != INFINITY && r.expires_at <= now {
                        debug!("route expired");
                        r.set_metric(INFINITY, p.metric_smoothing_alpha);
                        r.expires_at = now + p.route_expiry_time;
                    }
                }
                entries.retain(|r| !(r.metric == INFINITY && r.expires_at <= now && !r.selected));
            }
            tables.routes.retain(|_, entries| !entries.is_empty());

            tables
                .sources
                .retain(|_, s| now.duration_since(s.refreshed_at) < p.source_gc_time);

            tables.pending_seqno.retain(|key, pending| {
                if pending.next_resend > now {
                    return true;
                }
                if pending.resent >= MAX_RESENDS {
                    debug!(prefix = %key.0, "giving up on seqno request");
                    return false;
                }
                pending.resent += 1;
                pending.next_resend = now + p.initial_request_timeout;
                resends.push((*key, pending.seqno, pending.hop_count, pending.target.clone()));
                true
            });
        }

        core.reselect_all();

        for ((prefix, router_id), seqno, hop_count, target) in resends {
            let req = Value::SeqnoRequest(proto::SeqnoRequest {
                seqno,
                hop_count,
                router_id,
                prefix,
                source_prefix: None,
            });
            match target.and_then(|t| t.upgrade()) {
                Some(n) => n.send_values([req], p.urgent_timeout),
                None => {
                    let interfaces = core.interfaces.read().unwrap();
                    for intf in interfaces.values() {
                        intf.send_values(vec![req.clone()], p.urgent_timeout);
                    }
                }
            }
        }
    }
}
