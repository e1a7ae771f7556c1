use std::fmt;

use serde::{Deserialize, Serialize};

pub type NodeId = u8;
pub type SeqNo = u16;

pub const BROADCAST: NodeId = 0xFF;

/// Upper bound on mesh size tracked by a node.
pub const MAX_MONITORED_NODES: usize = 40;

pub const SLOTS_PER_FRAME: u8 = 10;
pub const FRAMES_PER_CYCLE: u8 = 10;
pub const CYCLES_PER_SUPERCYCLE: u8 = 2;
pub const FRAMES_PER_SUPERCYCLE: u8 = FRAMES_PER_CYCLE * CYCLES_PER_SUPERCYCLE;
pub const SLOTS_PER_SUPERCYCLE: u64 = (SLOTS_PER_FRAME as u64) * (FRAMES_PER_SUPERCYCLE as u64);
/// Slots 8 and 9 of each of the 20 frames.
pub const NC_SLOTS_PER_SUPERCYCLE: u8 = 40;

/// Single signed priority used across the stack.
///
/// `-1` is analog voice (PTT) preemption, `0..=3` are data tiers with 0 the
/// highest, and `4` is relay traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub struct Priority(i8);

impl Priority {
    pub const PTT: Priority = Priority(-1);
    pub const VOICE: Priority = Priority(0);
    pub const VIDEO: Priority = Priority(1);
    pub const FILE: Priority = Priority(2);
    pub const SMS: Priority = Priority(3);
    pub const RELAY: Priority = Priority(4);

    pub fn new(value: i8) -> Option<Self> {
        (-1..=4).contains(&value).then_some(Priority(value))
    }

    /// Builds a data-tier priority, accepting only `0..=3`.
    pub fn data_tier(tier: i8) -> Option<Self> {
        (0..=3).contains(&tier).then_some(Priority(tier))
    }

    pub fn value(self) -> i8 {
        self.0
    }

    /// Index into the data queues when this is a data tier.
    pub fn tier_index(self) -> Option<usize> {
        (0..=3).contains(&self.0).then_some(self.0 as usize)
    }
}

impl TryFrom<i8> for Priority {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        Priority::new(value).ok_or_else(|| format!("priority {} outside -1..=4", value))
    }
}

impl From<Priority> for i8 {
    fn from(p: Priority) -> i8 {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    AnalogVoice = 0,
    Voice = 1,
    Video = 2,
    File = 3,
    Sms = 4,
    Relay = 5,
    ControlRequest = 6,
    ControlConfirm = 7,
    Hello = 8,
    Tc = 9,
    Beacon = 10,
}

impl DataType {
    /// Priority an APP payload of this type is classified into.
    pub fn default_priority(self) -> Priority {
        match self {
            DataType::AnalogVoice => Priority::PTT,
            DataType::Voice => Priority::VOICE,
            DataType::Video => Priority::VIDEO,
            DataType::File => Priority::FILE,
            DataType::Sms => Priority::SMS,
            DataType::Relay => Priority::RELAY,
            DataType::ControlRequest | DataType::ControlConfirm => Priority::VOICE,
            DataType::Hello | DataType::Tc | DataType::Beacon => Priority::VOICE,
        }
    }

    /// Network-control traffic that travels in NC slots.
    pub fn is_network_control(self) -> bool {
        matches!(self, DataType::Hello | DataType::Tc | DataType::Beacon)
    }

    pub fn is_voice_control(self) -> bool {
        matches!(self, DataType::ControlRequest | DataType::ControlConfirm)
    }

    /// Types an application is allowed to inject.
    pub fn is_application(self) -> bool {
        matches!(
            self,
            DataType::AnalogVoice
                | DataType::Voice
                | DataType::Video
                | DataType::File
                | DataType::Sms
                | DataType::Relay
        )
    }
}

impl TryFrom<u8> for DataType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => DataType::AnalogVoice,
            1 => DataType::Voice,
            2 => DataType::Video,
            3 => DataType::File,
            4 => DataType::Sms,
            5 => DataType::Relay,
            6 => DataType::ControlRequest,
            7 => DataType::ControlConfirm,
            8 => DataType::Hello,
            9 => DataType::Tc,
            10 => DataType::Beacon,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionType {
    Unicast,
    Multicast,
    Broadcast,
}

/// Fixed-size set of node ids, small enough to travel inside fabric messages.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSet([u64; 4]);

impl NodeSet {
    pub const fn new() -> Self {
        NodeSet([0; 4])
    }

    pub fn insert(&mut self, id: NodeId) -> bool {
        let (word, bit) = Self::locate(id);
        let fresh = self.0[word] & bit == 0;
        self.0[word] |= bit;
        fresh
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        let (word, bit) = Self::locate(id);
        let present = self.0[word] & bit != 0;
        self.0[word] &= !bit;
        present
    }

    pub fn contains(&self, id: NodeId) -> bool {
        let (word, bit) = Self::locate(id);
        self.0[word] & bit != 0
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..=u8::MAX).filter(move |id| self.contains(*id))
    }

    fn locate(id: NodeId) -> (usize, u64) {
        ((id / 64) as usize, 1u64 << (id % 64))
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut set = NodeSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bounds() {
        assert_eq!(Priority::new(-1), Some(Priority::PTT));
        assert_eq!(Priority::new(4), Some(Priority::RELAY));
        assert!(Priority::new(5).is_none());
        assert!(Priority::new(-2).is_none());
        assert!(Priority::data_tier(4).is_none());
        assert_eq!(Priority::FILE.tier_index(), Some(2));
        assert_eq!(Priority::PTT.tier_index(), None);
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(DataType::AnalogVoice.default_priority(), Priority::PTT);
        assert_eq!(DataType::Voice.default_priority().value(), 0);
        assert_eq!(DataType::Video.default_priority().value(), 1);
        assert_eq!(DataType::File.default_priority().value(), 2);
        assert_eq!(DataType::Sms.default_priority().value(), 3);
        assert_eq!(DataType::Relay.default_priority().value(), 4);
    }

    #[test]
    fn test_data_type_tag_rejects_unknown() {
        assert_eq!(DataType::try_from(9), Ok(DataType::Tc));
        assert_eq!(DataType::try_from(42), Err(42));
    }

    #[test]
    fn test_node_set_membership() {
        let mut set: NodeSet = [1, 7, 200].into_iter().collect();
        assert!(set.contains(7));
        assert!(set.contains(200));
        assert!(!set.contains(8));
        assert_eq!(set.len(), 3);
        assert!(set.remove(7));
        assert!(!set.remove(7));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 200]);
    }
}
