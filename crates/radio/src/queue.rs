//! Bounded FIFO frame queues shared by RRC admission and the slot scheduler

use std::collections::VecDeque;

use tacmesh_core::{Frame, Priority};

use crate::RadioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Data(u8),
    AnalogVoice,
    Relay,
    Nc,
    ToL3,
}

impl QueueKind {
    pub fn for_priority(priority: Priority) -> QueueKind {
        match priority.tier_index() {
            Some(tier) => QueueKind::Data(tier as u8),
            None if priority == Priority::PTT => QueueKind::AnalogVoice,
            None => QueueKind::Relay,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Data(0) => "data0",
            QueueKind::Data(1) => "data1",
            QueueKind::Data(2) => "data2",
            QueueKind::Data(_) => "data3",
            QueueKind::AnalogVoice => "analog_voice",
            QueueKind::Relay => "relay",
            QueueKind::Nc => "nc",
            QueueKind::ToL3 => "to_l3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    Full,
    Empty,
    Duplicate,
}

impl From<QueueError> for RadioError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full => RadioError::QueueFull,
            QueueError::Empty => RadioError::QueueEmpty,
            QueueError::Duplicate => RadioError::Duplicate,
        }
    }
}

#[derive(Debug)]
pub struct FrameQueue {
    kind: QueueKind,
    items: VecDeque<Frame>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(kind: QueueKind, capacity: usize) -> Self {
        Self {
            kind,
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn enqueue(&mut self, frame: Frame) -> Result<(), QueueError> {
        if self.items.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        if self.contains(&frame) {
            return Err(QueueError::Duplicate);
        }
        self.items.push_back(frame);
        Ok(())
    }

    /// Puts a frame back at the head, used when PHY refuses a submission.
    pub fn requeue_front(&mut self, frame: Frame) -> Result<(), QueueError> {
        if self.items.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        if self.contains(&frame) {
            return Err(QueueError::Duplicate);
        }
        self.items.push_front(frame);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Result<Frame, QueueError> {
        self.items.pop_front().ok_or(QueueError::Empty)
    }

    pub fn peek(&self) -> Option<&Frame> {
        self.items.front()
    }

    /// Removes frames from the head while `predicate` holds.
    pub fn drain_while<F>(&mut self, mut predicate: F) -> Vec<Frame>
    where
        F: FnMut(&Frame) -> bool,
    {
        let mut drained = Vec::new();
        while let Some(front) = self.items.front() {
            if !predicate(front) {
                break;
            }
            if let Some(frame) = self.items.pop_front() {
                drained.push(frame);
            }
        }
        drained
    }

    /// Removes every frame matching `predicate`, keeping the order of the rest.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&Frame) -> bool,
    {
        let before = self.items.len();
        self.items.retain(|f| !predicate(f));
        before - self.items.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.items.iter()
    }

    fn contains(&self, frame: &Frame) -> bool {
        self.items
            .iter()
            .any(|f| f.source == frame.source && f.seq == frame.seq)
    }
}

/// All queues owned by the MAC of one node.
#[derive(Debug)]
pub struct QueueSet {
    data: [FrameQueue; 4],
    analog_voice: FrameQueue,
    relay: FrameQueue,
    nc: FrameQueue,
    to_l3: FrameQueue,
}

impl QueueSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: [0u8, 1, 2, 3].map(|tier| FrameQueue::new(QueueKind::Data(tier), capacity)),
            analog_voice: FrameQueue::new(QueueKind::AnalogVoice, capacity),
            relay: FrameQueue::new(QueueKind::Relay, capacity),
            nc: FrameQueue::new(QueueKind::Nc, capacity),
            to_l3: FrameQueue::new(QueueKind::ToL3, capacity),
        }
    }

    pub fn get(&self, kind: QueueKind) -> &FrameQueue {
        match kind {
            QueueKind::Data(tier) => &self.data[(tier as usize).min(3)],
            QueueKind::AnalogVoice => &self.analog_voice,
            QueueKind::Relay => &self.relay,
            QueueKind::Nc => &self.nc,
            QueueKind::ToL3 => &self.to_l3,
        }
    }

    pub fn get_mut(&mut self, kind: QueueKind) -> &mut FrameQueue {
        match kind {
            QueueKind::Data(tier) => &mut self.data[(tier as usize).min(3)],
            QueueKind::AnalogVoice => &mut self.analog_voice,
            QueueKind::Relay => &mut self.relay,
            QueueKind::Nc => &mut self.nc,
            QueueKind::ToL3 => &mut self.to_l3,
        }
    }

    /// Enqueues into the queue selected by the frame's priority.
    pub fn enqueue_by_priority(&mut self, frame: Frame) -> Result<QueueKind, QueueError> {
        let kind = QueueKind::for_priority(frame.priority);
        self.get_mut(kind).enqueue(frame)?;
        Ok(kind)
    }

    pub fn total_len(&self) -> usize {
        self.data.iter().map(FrameQueue::len).sum::<usize>()
            + self.analog_voice.len()
            + self.relay.len()
            + self.nc.len()
            + self.to_l3.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tacmesh_core::DataType;

    fn frame(source: u8, seq: u16, priority: Priority) -> Frame {
        Frame {
            source,
            destination: 9,
            next_hop: 9,
            ttl: 4,
            priority,
            data_type: DataType::Sms,
            seq,
            timestamp: 0,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn test_capacity_and_fifo() {
        let mut q = FrameQueue::new(QueueKind::Data(2), 3);
        for seq in 0..3 {
            q.enqueue(frame(1, seq, Priority::FILE)).unwrap();
        }
        assert!(q.is_full());
        assert_eq!(q.enqueue(frame(1, 9, Priority::FILE)), Err(QueueError::Full));
        assert_eq!(q.len(), 3);

        assert_eq!(q.peek().map(|f| f.seq), Some(0));
        assert_eq!(q.dequeue().unwrap().seq, 0);
        assert_eq!(q.dequeue().unwrap().seq, 1);
        assert_eq!(q.dequeue().unwrap().seq, 2);
        assert_eq!(q.dequeue(), Err(QueueError::Empty));
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let mut q = FrameQueue::new(QueueKind::Relay, 5);
        q.enqueue(frame(1, 7, Priority::RELAY)).unwrap();
        assert_eq!(q.enqueue(frame(1, 7, Priority::RELAY)), Err(QueueError::Duplicate));
        // same seq from another origin is a different frame
        q.enqueue(frame(2, 7, Priority::RELAY)).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_queue_errors_map_to_their_own_variants() {
        assert_eq!(RadioError::from(QueueError::Full), RadioError::QueueFull);
        assert_eq!(RadioError::from(QueueError::Empty), RadioError::QueueEmpty);
        assert_eq!(RadioError::from(QueueError::Duplicate), RadioError::Duplicate);
    }

    #[test]
    fn test_remove_where_keeps_order() {
        let mut q = FrameQueue::new(QueueKind::Data(0), 4);
        for seq in 1..=4 {
            q.enqueue(frame(1, seq, Priority::VOICE)).unwrap();
        }
        assert_eq!(q.remove_where(|f| f.seq == 2), 1);
        assert_eq!(q.remove_where(|f| f.seq == 9), 0);
        assert_eq!(q.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![1, 3, 4]);
    }

    #[test]
    fn test_requeue_front_and_drain_while() {
        let mut q = FrameQueue::new(QueueKind::Data(0), 4);
        q.enqueue(frame(1, 1, Priority::VOICE)).unwrap();
        q.enqueue(frame(1, 2, Priority::VOICE)).unwrap();
        let head = q.dequeue().unwrap();
        q.requeue_front(head).unwrap();
        assert_eq!(q.peek().map(|f| f.seq), Some(1));

        q.enqueue(frame(1, 3, Priority::VOICE)).unwrap();
        let drained = q.drain_while(|f| f.seq < 3);
        assert_eq!(drained.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_priority_routing() {
        let mut set = QueueSet::new(2);
        assert_eq!(set.enqueue_by_priority(frame(1, 1, Priority::PTT)), Ok(QueueKind::AnalogVoice));
        assert_eq!(set.enqueue_by_priority(frame(1, 2, Priority::SMS)), Ok(QueueKind::Data(3)));
        assert_eq!(set.enqueue_by_priority(frame(1, 3, Priority::RELAY)), Ok(QueueKind::Relay));
        assert_eq!(set.total_len(), 3);
        assert_eq!(set.get(QueueKind::Data(3)).len(), 1);
    }
}
