//! Broadcast messages and the receive-time-ordered message queue.
//!
//! The queue is a min-heap keyed on `recv_time`; ties pop in arbitrary
//! order. This ordering is the only scheduling guarantee the simulator
//! gives to the algorithms running on top of it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::NodeId;

/// A message in flight during one broadcast trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Message {
    /// Root of the broadcast this message belongs to.
    pub root: NodeId,
    /// Sender.
    pub src: NodeId,
    /// Receiver.
    pub dst: NodeId,
    /// Hop count from the root at the moment of emission.
    pub step: usize,
    /// Simulated send time in ms.
    pub send_time: f64,
    /// Simulated receive time in ms. Always >= `send_time`.
    pub recv_time: f64,
}

impl Message {
    pub fn new(
        root: NodeId,
        src: NodeId,
        dst: NodeId,
        step: usize,
        send_time: f64,
        recv_time: f64,
    ) -> Self {
        Message {
            root,
            src,
            dst,
            step,
            send_time,
            recv_time,
        }
    }
}

/// Heap entry with reversed total ordering on `recv_time`, so the
/// std max-heap pops the earliest message first.
#[derive(Debug)]
struct Pending(Message);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.recv_time == other.0.recv_time
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.recv_time.total_cmp(&self.0.recv_time)
    }
}

/// Min-heap of in-flight messages ordered by receive time.
#[derive(Debug, Default)]
pub struct MsgQueue {
    heap: BinaryHeap<Pending>,
}

impl MsgQueue {
    pub fn new() -> Self {
        MsgQueue {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.heap.push(Pending(msg));
    }

    /// Pop the message with the earliest receive time.
    pub fn pop(&mut self) -> Option<Message> {
        self.heap.pop().map(|p| p.0)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
