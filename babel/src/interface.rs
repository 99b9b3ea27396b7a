//! Per-interface state and timers (RFC 8966, section 3.2.3).
//!
//! An [`Interface`] owns the multicast group membership for one link, the
//! multicast Hello seqno and ticker, the periodic full-update ticker and
//! the table of neighbours keyed by their link-local address.

use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use babel_proto::{Hello, Value, MULTICAST_GROUP, PORT};

use crate::config::{InterfaceInfo, Parameters};
use crate::net::{DatagramSink, LinkInfo};
use crate::neighbour::Neighbour;
use crate::queue::SendQueue;
use crate::speaker::Core;

pub struct Interface {
    index: u32,
    name: String,
    mtu: usize,
    params: Parameters,

    hello_seqno: AtomicU16,
    neighbours: RwLock<FxHashMap<Ipv6Addr, Arc<Neighbour>>>,
    /// The multicast send queue; absent when multicast is disabled.
    queue: Option<SendQueue>,

    cancel: CancellationToken,
}

impl Interface {
    pub(crate) fn create(core: &Arc<Core>, link: &LinkInfo) -> io::Result<Arc<Interface>> {
        let multicast = core.config.multicast && link.multicast;
        if multicast {
            core.socket.join_multicast(link.index)?;
        }

        let queue = multicast.then(|| {
            let dest = SocketAddrV6::new(MULTICAST_GROUP, PORT, 0, link.index);
            SendQueue::new(
                format!("{}/multicast", link.name),
                link.mtu,
                Arc::new(DatagramSink::new(Arc::clone(&core.socket), dest)),
                core.cancel.child_token(),
            )
        });

        let intf = Arc::new(Interface {
            index: link.index,
            name: link.name.clone(),
            mtu: link.mtu,
            params: core.config.parameters.clone(),
            hello_seqno: AtomicU16::new(0),
            neighbours: RwLock::new(FxHashMap::default()),
            queue,
            cancel: core.cancel.child_token(),
        });

        tokio::spawn(Arc::clone(&intf).run(Arc::downgrade(core)));

        Ok(intf)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn info(&self) -> InterfaceInfo {
        InterfaceInfo { index: self.index, name: self.name.clone(), mtu: self.mtu }
    }

    pub(crate) fn neighbours(&self) -> Vec<Arc<Neighbour>> {
        self.neighbours.read().unwrap().values().cloned().collect()
    }

    /// Routes an incoming datagram to the sending neighbour, creating it on
    /// first contact.
    pub(crate) fn on_datagram(
        self: &Arc<Self>,
        core: &Arc<Core>,
        src: SocketAddrV6,
        data: &[u8],
    ) {
        let neighbour = self.find_or_create_neighbour(core, *src.ip());
        neighbour.handle_packet(core, data);
    }

    pub(crate) fn find_or_create_neighbour(
        self: &Arc<Self>,
        core: &Arc<Core>,
        addr: Ipv6Addr,
    ) -> Arc<Neighbour> {
        if let Some(n) = self.neighbours.read().unwrap().get(&addr) {
            return Arc::clone(n);
        }

        let mut created = None;
        let neighbour = {
            let mut neighbours = self.neighbours.write().unwrap();
            Arc::clone(neighbours.entry(addr).or_insert_with(|| {
                let dest = SocketAddrV6::new(addr, PORT, 0, self.index);
                let n = Neighbour::new(
                    core.config.parameters.clone(),
                    self.index,
                    addr,
                    self.mtu,
                    Arc::new(DatagramSink::new(Arc::clone(&core.socket), dest)),
                    core.cancel.child_token(),
                );
                tokio::spawn(Arc::clone(&n).run(Arc::downgrade(core)));
                created = Some(Arc::clone(&n));
                n
            }))
        };

        if let Some(n) = created {
            debug!(interface = %self.name, neighbour = %addr, "new neighbour");
            if let Some(handler) = &core.config.handler {
                handler.neighbour_added(&n.info());
            }
        }

        neighbour
    }

    pub(crate) fn remove_neighbour(&self, addr: Ipv6Addr) -> Option<Arc<Neighbour>> {
        self.neighbours.write().unwrap().remove(&addr)
    }

    /// Enqueues values towards every listener on this link: on the
    /// multicast queue when enabled, otherwise fanned out per neighbour.
    pub(crate) fn send_values(&self, vs: Vec<Value>, max_delay: Duration) {
        match &self.queue {
            Some(queue) => queue.send_values(vs, max_delay),
            None => {
                for n in self.neighbours.read().unwrap().values() {
                    n.send_values(vs.iter().cloned(), max_delay);
                }
            }
        }
    }

    fn send_multicast_hello(&self) {
        let seqno = self.hello_seqno.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let interval = self.params.multicast_hello_interval;
        let hello = Value::Hello(Hello { flags: 0, seqno, interval, timestamp: None });
        self.send_values(vec![hello], interval / 2);
    }

    /// The per-interface timer task: periodic multicast Hello and periodic
    /// full update.
    async fn run(self: Arc<Self>, core: Weak<Core>) {
        let mut hello = time::interval(self.params.multicast_hello_interval);
        let mut update = time::interval(self.params.update_interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = hello.tick() => self.send_multicast_hello(),
                _ = update.tick() => {
                    let Some(core) = core.upgrade() else { break };
                    core.send_full_update(&self);
                }
            }
        }
    }

    /// Stops the timers, the multicast queue and every neighbour.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        if let Some(queue) = &self.queue {
            queue.close().await;
        }
        let neighbours: Vec<_> =
            self.neighbours.write().unwrap().drain().map(|(_, n)| n).collect();
        for n in neighbours {
            n.close().await;
        }
    }
}
