//! Per-destination outgoing TLV queue with jittered flushing and MTU
//! packing (RFC 8966, sections 3.1 and 4.2).
//!
//! Values pushed with [`SendQueue::send_value`] are coalesced into as few
//! packets as fit the MTU. Each push arms the flush timer at a random point
//! in `[3/4·max_delay, 5/4·max_delay)`; a timer that is already armed
//! earlier is kept, so an urgent value can shorten the wait but a lazy one
//! cannot lengthen it.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use babel_proto::{Parser, Value, HEADER_LEN};

use crate::deadline::Deadline;

/// Re-arm interval used to drain a queue that did not fit one packet.
const PACING_TIMEOUT: Duration = Duration::from_millis(10);

/// A datagram-oriented sink bound to one destination address.
pub trait PacketSink: Send + Sync + 'static {
    fn send_packet<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;
}

pub(crate) struct SendQueue {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    label: String,
    mtu: usize,
    sink: Arc<dyn PacketSink>,
    fifo: Mutex<VecDeque<Value>>,
    timer: Deadline,
    shutdown: CancellationToken,
}

impl SendQueue {
    pub(crate) fn new(
        label: String,
        mtu: usize,
        sink: Arc<dyn PacketSink>,
        shutdown: CancellationToken,
    ) -> Self {
        let inner = Arc::new(Inner {
            label,
            mtu,
            sink,
            fifo: Mutex::new(VecDeque::new()),
            timer: Deadline::new(),
            shutdown,
        });

        let task = tokio::spawn(Arc::clone(&inner).run());

        Self { inner, task: Mutex::new(Some(task)) }
    }

    /// Enqueues a value to be sent within roughly `max_delay`. Never blocks
    /// beyond the queue mutex.
    pub(crate) fn send_value(&self, v: Value, max_delay: Duration) {
        self.inner.fifo.lock().unwrap().push_back(v);
        self.inner.timer.arm_earliest(Instant::now() + jitter(max_delay));
    }

    pub(crate) fn send_values(&self, vs: impl IntoIterator<Item = Value>, max_delay: Duration) {
        let mut fifo = self.inner.fifo.lock().unwrap();
        for v in vs {
            fifo.push_back(v);
        }
        drop(fifo);
        self.inner.timer.arm_earliest(Instant::now() + jitter(max_delay));
    }

    /// Stops the flush task, waiting for an in-flight flush to complete.
    pub(crate) async fn close(&self) {
        self.inner.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// The jittered delay for a push: uniform in `[3/4·d, 5/4·d)`.
fn jitter(d: Duration) -> Duration {
    d.mul_f64(0.75) + d.mul_f64(rand::random::<f64>() * 0.5)
}

impl Inner {
    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.timer.wait() => self.flush().await,
            }
        }
    }

    /// Packs queued values into one packet up to the MTU and hands it to
    /// the sink. Re-arms the pacing timer when values remain.
    async fn flush(&self) {
        let mut parser = Parser::new();
        let mut buf = BytesMut::with_capacity(self.mtu);
        parser.begin_packet(&mut buf);

        let mut packed = Vec::new();
        {
            let mut fifo = self.fifo.lock().unwrap();
            while let Some(front) = fifo.front() {
                let len = parser.value_length(front);
                if buf.len() + len > self.mtu {
                    if buf.len() == HEADER_LEN {
                        // A single oversize value can never be sent.
                        warn!(
                            queue = %self.label,
                            len,
                            mtu = self.mtu,
                            "dropping value larger than the interface MTU"
                        );
                        fifo.pop_front();
                        continue;
                    }
                    break;
                }

                let v = fifo.pop_front().unwrap();
                if let Err(e) = parser.append_value(&mut buf, &v) {
                    warn!(queue = %self.label, error = %e, "dropping unencodable value");
                    continue;
                }
                packed.push(v);
            }
        }

        if buf.len() == HEADER_LEN {
            return;
        }
        parser.finish_packet(&mut buf);

        match self.sink.send_packet(&buf).await {
            Ok(()) => {
                trace!(queue = %self.label, values = packed.len(), bytes = buf.len(), "flushed");
            }
            Err(e) => {
                // Keep the values for the next flush.
                debug!(queue = %self.label, error = %e, "packet write failed");
                let mut fifo = self.fifo.lock().unwrap();
                for v in packed.into_iter().rev() {
                    fifo.push_front(v);
                }
            }
        }

        if !self.fifo.lock().unwrap().is_empty() {
            self.timer.reset(PACING_TIMEOUT);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use babel_proto::{Acknowledgment, Packet};

    #[derive(Default)]
    struct MockSink {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl PacketSink for MockSink {
        fn send_packet<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async move {
                if self.fail.load(Ordering::Relaxed) {
                    return Err(io::Error::new(io::ErrorKind::Other, "sink failure"));
                }
                self.sent.lock().unwrap().push(buf.to_vec());
                Ok(())
            })
        }
    }

    fn ack(opaque: u16) -> Value {
        Value::Acknowledgment(Acknowledgment { opaque })
    }

    fn decode(buf: &[u8]) -> Packet {
        Parser::new().packet(buf).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn batches_values_into_one_packet() {
        let sink = Arc::new(MockSink::default());
        let q = SendQueue::new("test".into(), 1400, sink.clone(), CancellationToken::new());

        for i in 0..3 {
            q.send_value(ack(i), Duration::from_millis(100));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(decode(&sent[0]).body, vec![ack(0), ack(1), ack(2)]);

        q.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn respects_the_mtu_and_paces_the_remainder() {
        // Header 4 + three 4-octet acknowledgments fit a 16-octet MTU;
        // the fourth spills into a paced follow-up packet.
        let sink = Arc::new(MockSink::default());
        let q = SendQueue::new("test".into(), 16, sink.clone(), CancellationToken::new());

        q.send_values((0..4).map(ack), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(decode(&sent[0]).body.len(), 3);
        assert_eq!(decode(&sent[1]).body, vec![ack(3)]);

        q.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_values_on_write_failure() {
        let sink = Arc::new(MockSink::default());
        sink.fail.store(true, Ordering::Relaxed);
        let q = SendQueue::new("test".into(), 1400, sink.clone(), CancellationToken::new());

        q.send_value(ack(7), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.sent.lock().unwrap().is_empty());

        // Once the sink recovers, the retained value goes out first.
        sink.fail.store(false, Ordering::Relaxed);
        q.send_value(ack(8), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = sink.sent.lock().unwrap().clone();
        let bodies: Vec<_> = sent.iter().flat_map(|p| decode(p).body).collect();
        assert_eq!(bodies, vec![ack(7), ack(8)]);

        q.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_value_shortens_the_flush() {
        let sink = Arc::new(MockSink::default());
        let q = SendQueue::new("test".into(), 1400, sink.clone(), CancellationToken::new());

        q.send_value(ack(1), Duration::from_secs(8));
        q.send_value(ack(2), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        q.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_value_does_not_lengthen_the_flush() {
        let sink = Arc::new(MockSink::default());
        let q = SendQueue::new("test".into(), 1400, sink.clone(), CancellationToken::new());

        q.send_value(ack(1), Duration::from_millis(100));
        q.send_value(ack(2), Duration::from_secs(8));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        assert_eq!(decode(&sink.sent.lock().unwrap()[0]).body.len(), 2);

        q.close().await;
    }
}
