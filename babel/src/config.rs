//! Speaker configuration (RFC 8966, appendix B for the protocol
//! parameters).

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;

use babel_proto::{Metric, RouterId, SequenceNumber};

use crate::Error;

/// Decides which host interfaces the speaker binds.
pub type InterfaceFilter = dyn Fn(&str) -> bool + Send + Sync;

/// Overrides the metric of an acquired route; returning
/// [`babel_proto::INFINITY`] rejects it.
pub type RouteFilter = dyn Fn(&RouteInfo) -> Metric + Send + Sync;

/// A route as exposed to filters and observers.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub prefix: IpNetwork,
    pub router_id: RouterId,
    pub neighbour: NeighbourInfo,
    pub next_hop: std::net::IpAddr,
    pub seqno: SequenceNumber,
    /// The advertised metric, before the link cost is added.
    pub metric: Metric,
    pub selected: bool,
}

/// An interface as exposed to observer callbacks.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub index: u32,
    pub name: String,
    pub mtu: usize,
}

/// A neighbour as exposed to observer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighbourInfo {
    /// The peer's link-local address.
    pub address: Ipv6Addr,
    /// The index of the interface the peer is reachable on.
    pub ifindex: u32,
}

/// Observer callbacks, invoked from the speaker event loop. They must not
/// block indefinitely.
pub trait Handler: Send + Sync + 'static {
    fn interface_added(&self, _intf: &InterfaceInfo) {}
    fn interface_removed(&self, _intf: &InterfaceInfo) {}
    fn neighbour_added(&self, _neighbour: &NeighbourInfo) {}
    fn neighbour_removed(&self, _neighbour: &NeighbourInfo) {}
}

/// Protocol timing and cost parameters (RFC 8966, appendix B).
#[derive(Debug, Clone)]
pub struct Parameters {
    pub multicast_hello_interval: Duration,
    /// Zero disables scheduled unicast Hellos.
    pub unicast_hello_interval: Duration,
    pub update_interval: Duration,
    pub ihu_interval: Duration,
    /// The IHU hold time is this factor times the advertised IHU interval.
    pub ihu_hold_time_factor: f64,
    /// The rxcost of a live wired link (k-out-of-j estimator, C = 96).
    pub nominal_link_cost: Metric,
    pub urgent_timeout: Duration,
    pub route_expiry_time: Duration,
    pub source_gc_time: Duration,
    pub initial_request_timeout: Duration,
    /// EWMA factor for the smoothed route metric, within [0.5, 0.875].
    pub metric_smoothing_alpha: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            multicast_hello_interval: Duration::from_secs(4),
            unicast_hello_interval: Duration::ZERO,
            update_interval: Duration::from_secs(16),
            ihu_interval: Duration::from_secs(12),
            ihu_hold_time_factor: 3.5,
            nominal_link_cost: 96,
            urgent_timeout: Duration::from_millis(200),
            route_expiry_time: Duration::from_secs(56),
            source_gc_time: Duration::from_secs(180),
            initial_request_timeout: Duration::from_secs(2),
            metric_smoothing_alpha: 0.75,
        }
    }
}

/// Configuration consumed by [`crate::Speaker::new`].
#[derive(Clone, Default)]
pub struct SpeakerConfig {
    /// Enables the multicast transport (group membership, multicast Hellos
    /// and updates).
    pub multicast: bool,
    /// The speaker's router-id; a random one is generated when unset.
    pub router_id: Option<RouterId>,
    /// Binds only the interfaces the filter accepts. All non-loopback
    /// interfaces when unset.
    pub interface_filter: Option<Arc<InterfaceFilter>>,
    /// Overrides or rejects acquired routes.
    pub route_filter: Option<Arc<RouteFilter>>,
    /// Peers to talk to without multicast discovery. The scope id selects
    /// the interface.
    pub unicast_peers: Vec<SocketAddrV6>,
    /// Observer callbacks.
    pub handler: Option<Arc<dyn Handler>>,
    pub parameters: Parameters,
}

impl SpeakerConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        let p = &self.parameters;
        if p.multicast_hello_interval.is_zero() {
            return Err(Error::Config("multicast hello interval must be nonzero".into()));
        }
        if p.update_interval.is_zero() {
            return Err(Error::Config("update interval must be nonzero".into()));
        }
        if p.ihu_interval.is_zero() {
            return Err(Error::Config("IHU interval must be nonzero".into()));
        }
        if p.ihu_hold_time_factor < 1.0 {
            return Err(Error::Config("IHU hold time factor must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&p.metric_smoothing_alpha) {
            return Err(Error::Config("metric smoothing alpha must be in [0, 1)".into()));
        }
        if let Some(rid) = self.router_id {
            if !rid.is_valid() {
                return Err(Error::Config("router-id must not be all zeroes or all ones".into()));
            }
        }
        Ok(())
    }
}
