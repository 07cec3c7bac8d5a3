use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::core::queue::request::Request;

/// Heap entry ordered per spec §4.6: requests from the same user compare by
/// arrival time (FIFO within a user); requests from different users compare
/// by priority, falling back to arrival time. `BinaryHeap` is a max-heap so
/// this `Ord` is inverted relative to "pop smallest first" - see `pop`.
struct HeapItem(Request);

impl HeapItem {
    fn cmp_key(&self, other: &Self) -> Ordering {
        if self.0.user_id == other.0.user_id {
            self.0.arrival_time.cmp(&other.0.arrival_time)
        } else {
            self.0
                .priority
                .partial_cmp(&other.0.priority)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.0.arrival_time.cmp(&other.0.arrival_time))
        }
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key(other) == Ordering::Equal
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap pops the greatest element, we want the
        // "smallest" (earliest arrival / lowest priority) out first.
        other.cmp_key(self)
    }
}

/// User-fair priority heap with a cooperative, rate-limited drain loop.
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<HeapItem>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a request and wake any drain loop parked waiting for work.
    pub fn push_request(&self, req: Request) {
        if self.closed.load(AtomicOrdering::Acquire) {
            // Closed queues drop new pushes; the caller's receiver will
            // simply never be notified, mirroring a closed channel.
            return;
        }
        self.heap.lock().push(HeapItem(req));
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    fn pop_locked(&self) -> Option<Request> {
        self.heap.lock().pop().map(|item| item.0)
    }

    /// Idempotent shutdown: wakes any waiter parked in `run` so it can
    /// observe the closed flag and exit.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    /// Drain loop: ticks at `1s / qps`, popping (and notifying) exactly one
    /// request per tick. Blocks cooperatively on `notify` when the heap is
    /// empty, re-checking on every wakeup to tolerate spurious notifies.
    pub async fn run(&self, qps: f64) {
        let period = Duration::from_secs_f64(1.0 / qps.max(0.001));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.is_closed() {
                debug!("priority queue drain loop exiting: closed");
                return;
            }
            interval.tick().await;
            if self.is_closed() {
                return;
            }

            let req = loop {
                if let Some(req) = self.pop_locked() {
                    break req;
                }
                if self.is_closed() {
                    return;
                }
                self.notify.notified().await;
            };

            if req.notify.send(()).is_err() {
                warn!(req_id = %req.req_id, "dropped priority-queue notify: receiver gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_user_orders_by_arrival() {
        let pq = PriorityQueue::new();
        let (r1, _rx1) = Request::new("a", "u1", "m", 5.0, 10);
        let (r2, _rx2) = Request::new("b", "u1", "m", 1.0, 5);
        pq.push_request(r1);
        pq.push_request(r2);

        let first = pq.pop_locked().unwrap();
        assert_eq!(first.req_id, "b"); // earlier arrival_time wins despite higher priority number
        let second = pq.pop_locked().unwrap();
        assert_eq!(second.req_id, "a");
    }

    #[test]
    fn different_users_order_by_priority() {
        let pq = PriorityQueue::new();
        let (r1, _rx1) = Request::new("a", "u1", "m", 5.0, 1);
        let (r2, _rx2) = Request::new("b", "u2", "m", 1.0, 2);
        pq.push_request(r1);
        pq.push_request(r2);

        let first = pq.pop_locked().unwrap();
        assert_eq!(first.req_id, "b"); // lower priority value = earlier
    }

    #[tokio::test]
    async fn close_is_idempotent_and_wakes_waiters() {
        let pq = std::sync::Arc::new(PriorityQueue::new());
        let pq2 = pq.clone();
        let handle = tokio::spawn(async move {
            pq2.run(1000.0).await;
        });
        pq.close();
        pq.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run loop should exit promptly after close")
            .unwrap();
    }

    #[tokio::test]
    async fn push_after_close_is_a_no_op() {
        let pq = PriorityQueue::new();
        pq.close();
        let (r, _rx) = Request::new("a", "u1", "m", 1.0, 1);
        pq.push_request(r);
        assert!(pq.is_empty());
    }
}
