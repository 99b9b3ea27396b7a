//! Per-neighbour state and timers (RFC 8966, section 3.2.4).
//!
//! One [`Neighbour`] exists per (interface, link-local peer) pair. It owns
//! the two Hello histories, the IHU hold deadline, the outgoing unicast
//! Hello seqno and a send queue bound to the peer's unicast address. Link
//! cost follows the 2-out-of-3 estimator with a nominal cost of 96 on wired
//! links (appendix A.2.1).

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use babel_proto::{
    Acknowledgment, Hello, Ihu, Metric, Parser, Value, FLAG_HELLO_UNICAST, INFINITY,
};

use crate::config::{NeighbourInfo, Parameters};
use crate::deadline::Deadline;
use crate::history::HelloHistory;
use crate::queue::{PacketSink, SendQueue};
use crate::speaker::Core;

/// Hello reception state for one direction (unicast or multicast).
#[derive(Default)]
struct HelloState {
    history: HelloHistory,
    /// The interval the peer last advertised; arms the miss watchdog.
    interval: Option<Duration>,
}

pub struct Neighbour {
    /// The peer's link-local address.
    address: Ipv6Addr,
    /// The interface the peer is reachable on.
    ifindex: u32,
    params: Parameters,

    queue: SendQueue,
    parser: Mutex<Parser>,

    hello_unicast: Mutex<HelloState>,
    hello_multicast: Mutex<HelloState>,
    watchdog_unicast: Deadline,
    watchdog_multicast: Deadline,

    /// The rxcost advertised by the peer's last IHU; infinity once the hold
    /// deadline lapses.
    tx_cost: AtomicU16,
    ihu_timeout: Deadline,

    unicast_hello_seqno: AtomicU16,

    cancel: CancellationToken,
}

impl Neighbour {
    pub(crate) fn new(
        params: Parameters,
        ifindex: u32,
        address: Ipv6Addr,
        mtu: usize,
        sink: Arc<dyn PacketSink>,
        cancel: CancellationToken,
    ) -> Arc<Neighbour> {
        let queue = SendQueue::new(format!("{address}%{ifindex}"), mtu, sink, cancel.child_token());

        Arc::new(Neighbour {
            address,
            ifindex,
            params,
            queue,
            parser: Mutex::new(Parser::new()),
            hello_unicast: Mutex::default(),
            hello_multicast: Mutex::default(),
            watchdog_unicast: Deadline::new(),
            watchdog_multicast: Deadline::new(),
            tx_cost: AtomicU16::new(INFINITY),
            ihu_timeout: Deadline::new(),
            unicast_hello_seqno: AtomicU16::new(0),
            cancel,
        })
    }

    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// The peer's unicast destination as used by the send queue.
    pub fn unicast_dest(&self) -> SocketAddrV6 {
        SocketAddrV6::new(self.address, babel_proto::PORT, 0, self.ifindex)
    }

    pub(crate) fn key(&self) -> (u32, Ipv6Addr) {
        (self.ifindex, self.address)
    }

    pub fn info(&self) -> NeighbourInfo {
        NeighbourInfo { address: self.address, ifindex: self.ifindex }
    }

    // Cost model (RFC 8966, section 3.4.3 and appendix A.2.1)

    /// The cost of receiving from this neighbour: the nominal link cost
    /// while either Hello stream passes 2-out-of-3, infinity otherwise.
    pub fn rx_cost(&self) -> Metric {
        let alive = self.hello_unicast.lock().unwrap().history.out_of(2, 3)
            || self.hello_multicast.lock().unwrap().history.out_of(2, 3);
        if alive {
            self.params.nominal_link_cost
        } else {
            INFINITY
        }
    }

    pub fn tx_cost(&self) -> Metric {
        self.tx_cost.load(Ordering::Relaxed)
    }

    /// The link cost used for route metrics.
    pub fn cost(&self) -> Metric {
        if self.rx_cost() == INFINITY {
            INFINITY
        } else {
            self.tx_cost()
        }
    }

    // TLV handlers

    /// Parses one packet from the peer and dispatches its TLVs.
    /// Decode failures drop the packet without touching neighbour state.
    pub(crate) fn handle_packet(self: &Arc<Self>, core: &Arc<Core>, data: &[u8]) {
        let pkt = match self.parser.lock().unwrap().packet(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(neighbour = %self.address, error = %e, "dropping undecodable packet");
                return;
            }
        };

        let mut ack_requests = Vec::new();
        let mut link_changed = false;

        for v in pkt.body {
            trace!(neighbour = %self.address, tlv = v.tlv_type(), "received value");
            match v {
                Value::Hello(h) => {
                    self.on_hello(&h);
                    link_changed = true;
                }
                Value::Ihu(ihu) => {
                    self.on_ihu(&ihu);
                    link_changed = true;
                }
                Value::AcknowledgmentRequest(r) => ack_requests.push(r),
                Value::Acknowledgment(a) => core.on_acknowledgment(self, &a),
                Value::Update(u) => core.on_update(self, u),
                Value::RouteRequest(r) => core.on_route_request(self, &r),
                Value::SeqnoRequest(r) => core.on_seqno_request(self, &r),
                // Router-Id and Next Hop were consumed by the parser state;
                // padding and MACs carry no meaning here.
                Value::Pad1
                | Value::PadN { .. }
                | Value::RouterId(_)
                | Value::NextHop(_)
                | Value::Mac(_) => {}
            }
        }

        // Acknowledgments go out only once all other TLVs were handled.
        for r in ack_requests {
            self.queue.send_value(
                Value::Acknowledgment(Acknowledgment { opaque: r.opaque }),
                r.interval.mul_f64(0.6),
            );
        }

        if link_changed {
            core.reselect_all();
        }
    }

    /// Records a Hello into the matching history and re-arms the miss
    /// watchdog at 3/2 times the advertised interval.
    pub(crate) fn on_hello(&self, h: &Hello) {
        let (state, watchdog) = if h.flags & FLAG_HELLO_UNICAST != 0 {
            (&self.hello_unicast, &self.watchdog_unicast)
        } else {
            (&self.hello_multicast, &self.watchdog_multicast)
        };

        let mut st = state.lock().unwrap();
        if st.history.update(h.seqno) {
            debug!(neighbour = %self.address, seqno = h.seqno, "hello history reset");
        }
        if !h.interval.is_zero() {
            st.interval = Some(h.interval);
            watchdog.reset(h.interval * 3 / 2);
        }
    }

    /// Accepts an IHU: the peer's view of the receive cost becomes our
    /// txcost and the hold deadline is re-armed.
    pub(crate) fn on_ihu(&self, ihu: &Ihu) {
        self.ihu_timeout.reset(ihu.interval.mul_f64(self.params.ihu_hold_time_factor));
        self.tx_cost.store(ihu.rx_cost, Ordering::Relaxed);
    }

    /// A watchdog fired: an expected Hello did not arrive. Returns true
    /// when both histories drained, meaning the neighbour is gone.
    pub(crate) fn on_hello_missed(&self, unicast: bool) -> bool {
        let (state, watchdog) = if unicast {
            (&self.hello_unicast, &self.watchdog_unicast)
        } else {
            (&self.hello_multicast, &self.watchdog_multicast)
        };

        let mut st = state.lock().unwrap();
        st.history.missed();
        if let Some(interval) = st.interval {
            watchdog.reset(interval);
        }
        drop(st);

        self.hello_unicast.lock().unwrap().history.is_empty()
            && self.hello_multicast.lock().unwrap().history.is_empty()
    }

    // Periodic output

    fn send_unicast_hello(&self) {
        let seqno = self.unicast_hello_seqno.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.queue.send_value(
            Value::Hello(Hello {
                flags: FLAG_HELLO_UNICAST,
                seqno,
                interval: self.params.unicast_hello_interval,
                timestamp: None,
            }),
            self.params.unicast_hello_interval / 2,
        );
    }

    fn send_ihu(&self) {
        self.queue.send_value(
            Value::Ihu(Ihu {
                rx_cost: self.rx_cost(),
                interval: self.params.ihu_interval,
                address: self.address.into(),
                timestamp: None,
            }),
            self.params.multicast_hello_interval / 2,
        );
    }

    /// Enqueues values for unicast transmission to this peer.
    pub(crate) fn send_values(&self, vs: impl IntoIterator<Item = Value>, max_delay: Duration) {
        self.queue.send_values(vs, max_delay);
    }

    /// The per-neighbour timer task: periodic unicast Hello and IHU, the
    /// IHU hold watchdog and the Hello miss watchdogs.
    pub(crate) async fn run(self: Arc<Self>, core: Weak<Core>) {
        let mut ihu = time::interval(self.params.ihu_interval);
        let mut unicast_hello = (!self.params.unicast_hello_interval.is_zero())
            .then(|| time::interval(self.params.unicast_hello_interval));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ihu.tick() => self.send_ihu(),
                _ = tick_opt(&mut unicast_hello) => self.send_unicast_hello(),
                _ = self.ihu_timeout.wait() => {
                    warn!(neighbour = %self.address, "IHU hold time expired");
                    self.tx_cost.store(INFINITY, Ordering::Relaxed);
                    if let Some(core) = core.upgrade() {
                        core.reselect_all();
                    }
                }
                _ = self.watchdog_unicast.wait() => {
                    if self.handle_missed(&core, true) {
                        break;
                    }
                }
                _ = self.watchdog_multicast.wait() => {
                    if self.handle_missed(&core, false) {
                        break;
                    }
                }
            }
        }
    }

    fn handle_missed(&self, core: &Weak<Core>, unicast: bool) -> bool {
        let dead = self.on_hello_missed(unicast);
        let Some(core) = core.upgrade() else {
            return true;
        };
        if dead {
            debug!(neighbour = %self.address, "both hello histories empty");
            core.schedule_neighbour_removal(self.key());
            true
        } else {
            core.reselect_all();
            false
        }
    }

    /// Stops the timer task and the send queue, draining an in-flight
    /// flush.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        self.queue.close().await;
    }
}

async fn tick_opt(interval: &mut Option<time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}
