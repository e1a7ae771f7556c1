//! Per-slot TDMA transmit decision

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use log::{debug, trace, warn};

use tacmesh_core::{Frame, NodeId, SeqNo};

use crate::queue::{QueueKind, QueueSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// Mandatory voice
    Mv,
    /// Dynamic use
    Du,
    /// General use
    Gu,
    /// Network control
    Nc,
}

pub const SLOT_SCHEDULE: [SlotType; 10] = [
    SlotType::Mv,
    SlotType::Du,
    SlotType::Du,
    SlotType::Du,
    SlotType::Gu,
    SlotType::Gu,
    SlotType::Gu,
    SlotType::Gu,
    SlotType::Nc,
    SlotType::Nc,
];

const MV_ORDER: [QueueKind; 1] = [QueueKind::Data(0)];
const DU_ORDER: [QueueKind; 2] = [QueueKind::Data(0), QueueKind::Data(1)];
const GU_ORDER: [QueueKind; 3] = [QueueKind::Relay, QueueKind::Data(2), QueueKind::Data(3)];

/// Contention decision for GU slots.
pub trait Backoff: Send {
    fn may_transmit(&mut self) -> bool;
}

/// One Bernoulli trial per contended slot.
pub struct BernoulliBackoff {
    rng: StdRng,
    probability: f64,
}

impl BernoulliBackoff {
    pub fn new(transmit_probability: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let probability = if transmit_probability.is_finite() {
            transmit_probability.clamp(0.0, 1.0)
        } else {
            warn!("Invalid GU transmit probability {}, using 0.5", transmit_probability);
            0.5
        };
        Self { rng, probability }
    }
}

impl Backoff for BernoulliBackoff {
    fn may_transmit(&mut self) -> bool {
        self.rng.random_bool(self.probability)
    }
}

/// What the scheduler needs to know about the current slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotContext {
    pub slot_in_frame: u8,
    pub nc_slot: Option<u8>,
    pub own_nc_slot: u8,
    pub synchronised: bool,
    /// Full frames since sync, `None` inside the partial sync frame.
    pub frame_count: Option<u64>,
    pub voice_active: bool,
    /// Another node currently holds the MV reservation.
    pub mv_held_elsewhere: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotDecision {
    Transmit { frame: Frame, source: QueueKind },
    Idle,
    Listen,
    Backoff,
    Silent,
}

#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub transmitted: u64,
    pub voice_transmitted: u64,
    pub idle: u64,
    pub listen: u64,
    pub backoffs: u64,
    pub silent: u64,
    pub spurious: u64,
    pub phy_submit_drops: u64,
}

/// Decides which queue, if any, transmits in each slot.
pub struct SlotScheduler {
    backoff: Box<dyn Backoff>,
    retried: Option<(NodeId, SeqNo)>,
    stats: SchedulerStats,
}

impl SlotScheduler {
    pub fn new(backoff: Box<dyn Backoff>) -> Self {
        Self {
            backoff,
            retried: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn slot_type(slot_in_frame: u8) -> SlotType {
        SLOT_SCHEDULE[(slot_in_frame as usize) % SLOT_SCHEDULE.len()]
    }

    /// Picks at most one frame for this slot.
    pub fn decide(&mut self, ctx: &SlotContext, queues: &mut QueueSet) -> SlotDecision {
        let decision = self.select(ctx, queues);
        match &decision {
            SlotDecision::Transmit { source, .. } => {
                self.stats.transmitted += 1;
                if *source == QueueKind::AnalogVoice {
                    self.stats.voice_transmitted += 1;
                }
            }
            SlotDecision::Idle => self.stats.idle += 1,
            SlotDecision::Listen => self.stats.listen += 1,
            SlotDecision::Backoff => self.stats.backoffs += 1,
            SlotDecision::Silent => self.stats.silent += 1,
        }
        trace!("slot {} -> {:?}", ctx.slot_in_frame, decision_name(&decision));
        decision
    }

    fn select(&mut self, ctx: &SlotContext, queues: &mut QueueSet) -> SlotDecision {
        if !ctx.synchronised {
            return SlotDecision::Silent;
        }
        let slot_type = Self::slot_type(ctx.slot_in_frame);
        match ctx.frame_count {
            None => return SlotDecision::Silent,
            Some(0) if slot_type != SlotType::Nc => return SlotDecision::Silent,
            _ => {}
        }

        match slot_type {
            SlotType::Mv => {
                if ctx.voice_active && !queues.get(QueueKind::AnalogVoice).is_empty() {
                    return self.pull(QueueKind::AnalogVoice, queues);
                }
                if ctx.mv_held_elsewhere {
                    return SlotDecision::Listen;
                }
                self.pull_first(&MV_ORDER, queues)
            }
            SlotType::Du => self.pull_first(&DU_ORDER, queues),
            SlotType::Gu => {
                if GU_ORDER.iter().all(|k| queues.get(*k).is_empty()) {
                    return SlotDecision::Idle;
                }
                if !self.backoff.may_transmit() {
                    return SlotDecision::Backoff;
                }
                self.pull_first(&GU_ORDER, queues)
            }
            SlotType::Nc => {
                if ctx.nc_slot == Some(ctx.own_nc_slot) && !queues.get(QueueKind::Nc).is_empty() {
                    self.pull(QueueKind::Nc, queues)
                } else {
                    SlotDecision::Listen
                }
            }
        }
    }

    fn pull_first(&mut self, order: &[QueueKind], queues: &mut QueueSet) -> SlotDecision {
        match order.iter().find(|k| !queues.get(**k).is_empty()) {
            Some(kind) => self.pull(*kind, queues),
            None => SlotDecision::Idle,
        }
    }

    fn pull(&mut self, kind: QueueKind, queues: &mut QueueSet) -> SlotDecision {
        match queues.get_mut(kind).dequeue() {
            Ok(frame) => SlotDecision::Transmit { frame, source: kind },
            Err(_) => {
                self.stats.spurious += 1;
                SlotDecision::Idle
            }
        }
    }

    /// PHY refused the frame: requeue at the head once, drop on the second refusal.
    /// Returns `true` when the frame went back into its queue.
    pub fn on_phy_rejected(&mut self, frame: Frame, source: QueueKind, queues: &mut QueueSet) -> bool {
        let key = (frame.source, frame.seq);
        if self.retried == Some(key) {
            self.retried = None;
            self.stats.phy_submit_drops += 1;
            warn!("PHY rejected frame {}:{} twice, dropping", frame.source, frame.seq);
            return false;
        }
        match queues.get_mut(source).requeue_front(frame) {
            Ok(()) => {
                debug!("PHY rejected frame {}:{}, back to head of {}", key.0, key.1, source.name());
                self.retried = Some(key);
                true
            }
            Err(_) => {
                self.stats.phy_submit_drops += 1;
                false
            }
        }
    }

    pub fn on_phy_accepted(&mut self, frame: &Frame) {
        if self.retried == Some((frame.source, frame.seq)) {
            self.retried = None;
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

fn decision_name(decision: &SlotDecision) -> &'static str {
    match decision {
        SlotDecision::Transmit { source, .. } => source.name(),
        SlotDecision::Idle => "idle",
        SlotDecision::Listen => "listen",
        SlotDecision::Backoff => "backoff",
        SlotDecision::Silent => "silent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use bytes::Bytes;
    use tacmesh_core::{DataType, Priority};

    struct Scripted(VecDeque<bool>);

    impl Backoff for Scripted {
        fn may_transmit(&mut self) -> bool {
            self.0.pop_front().unwrap_or(true)
        }
    }

    fn scheduler(script: &[bool]) -> SlotScheduler {
        SlotScheduler::new(Box::new(Scripted(script.iter().copied().collect())))
    }

    fn frame(seq: SeqNo, priority: Priority) -> Frame {
        Frame {
            source: 1,
            destination: 2,
            next_hop: 2,
            ttl: 4,
            priority,
            data_type: DataType::Sms,
            seq,
            timestamp: 0,
            payload: Bytes::from_static(b"p"),
        }
    }

    fn ctx(slot: u8) -> SlotContext {
        SlotContext {
            slot_in_frame: slot,
            nc_slot: if slot >= 8 { Some(slot - 7) } else { None },
            own_nc_slot: 1,
            synchronised: true,
            frame_count: Some(5),
            voice_active: false,
            mv_held_elsewhere: false,
        }
    }

    fn transmitted_seq(decision: &SlotDecision) -> Option<SeqNo> {
        match decision {
            SlotDecision::Transmit { frame, .. } => Some(frame.seq),
            _ => None,
        }
    }

    #[test]
    fn test_du_prefers_priority_zero() {
        let mut queues = QueueSet::new(10);
        for seq in 0..10 {
            queues.enqueue_by_priority(frame(100 + seq, Priority::FILE)).unwrap();
        }
        queues.enqueue_by_priority(frame(1, Priority::VOICE)).unwrap();
        let mut sched = scheduler(&[]);
        let decision = sched.decide(&ctx(1), &mut queues);
        assert_eq!(transmitted_seq(&decision), Some(1));
        assert_eq!(queues.get(QueueKind::Data(2)).len(), 10);
        // DU never drains GU-class traffic
        assert_eq!(sched.decide(&ctx(2), &mut queues), SlotDecision::Idle);
    }

    #[test]
    fn test_gu_backoff_then_transmit() {
        let mut queues = QueueSet::new(10);
        queues.enqueue_by_priority(frame(7, Priority::SMS)).unwrap();
        let mut sched = scheduler(&[false, true]);
        assert_eq!(sched.decide(&ctx(4), &mut queues), SlotDecision::Backoff);
        assert_eq!(transmitted_seq(&sched.decide(&ctx(5), &mut queues)), Some(7));
        assert_eq!(sched.stats().backoffs, 1);
        assert_eq!(sched.stats().transmitted, 1);
    }

    #[test]
    fn test_gu_order_relay_first() {
        let mut queues = QueueSet::new(10);
        queues.enqueue_by_priority(frame(2, Priority::FILE)).unwrap();
        queues.enqueue_by_priority(frame(3, Priority::RELAY)).unwrap();
        let mut sched = scheduler(&[]);
        assert_eq!(transmitted_seq(&sched.decide(&ctx(6), &mut queues)), Some(3));
        assert_eq!(transmitted_seq(&sched.decide(&ctx(7), &mut queues)), Some(2));
    }

    #[test]
    fn test_mv_voice_then_fallback() {
        let mut queues = QueueSet::new(10);
        queues.enqueue_by_priority(frame(1, Priority::VOICE)).unwrap();
        queues.enqueue_by_priority(frame(2, Priority::PTT)).unwrap();
        let mut sched = scheduler(&[]);

        let mut voice_ctx = ctx(0);
        voice_ctx.voice_active = true;
        let decision = sched.decide(&voice_ctx, &mut queues);
        assert!(matches!(decision, SlotDecision::Transmit { source: QueueKind::AnalogVoice, .. }));

        // no reservation: priority-0 data uses MV
        assert_eq!(transmitted_seq(&sched.decide(&ctx(0), &mut queues)), Some(1));

        queues.enqueue_by_priority(frame(3, Priority::VOICE)).unwrap();
        let mut held = ctx(0);
        held.mv_held_elsewhere = true;
        assert_eq!(sched.decide(&held, &mut queues), SlotDecision::Listen);
    }

    #[test]
    fn test_nc_only_in_own_slot() {
        let mut queues = QueueSet::new(10);
        queues.get_mut(QueueKind::Nc).enqueue(frame(9, Priority::VOICE)).unwrap();
        let mut sched = scheduler(&[]);
        // slot 9 of frame -> nc number 2, not ours
        assert_eq!(sched.decide(&ctx(9), &mut queues), SlotDecision::Listen);
        assert_eq!(transmitted_seq(&sched.decide(&ctx(8), &mut queues)), Some(9));
    }

    #[test]
    fn test_first_frame_is_silent_except_nc() {
        let mut queues = QueueSet::new(10);
        queues.enqueue_by_priority(frame(1, Priority::VOICE)).unwrap();
        queues.get_mut(QueueKind::Nc).enqueue(frame(2, Priority::VOICE)).unwrap();
        let mut sched = scheduler(&[]);
        for slot in 0..8 {
            let mut c = ctx(slot);
            c.frame_count = Some(0);
            assert_eq!(sched.decide(&c, &mut queues), SlotDecision::Silent);
        }
        let mut nc = ctx(8);
        nc.frame_count = Some(0);
        assert_eq!(transmitted_seq(&sched.decide(&nc, &mut queues)), Some(2));

        let mut unsynced = ctx(1);
        unsynced.synchronised = false;
        assert_eq!(sched.decide(&unsynced, &mut queues), SlotDecision::Silent);
        assert_eq!(queues.get(QueueKind::Data(0)).len(), 1);
    }

    #[test]
    fn test_phy_rejection_retries_once() {
        let mut queues = QueueSet::new(10);
        queues.enqueue_by_priority(frame(1, Priority::VOICE)).unwrap();
        queues.enqueue_by_priority(frame(2, Priority::VOICE)).unwrap();
        let mut sched = scheduler(&[]);

        let SlotDecision::Transmit { frame: f, source } = sched.decide(&ctx(1), &mut queues) else {
            panic!("expected transmit");
        };
        assert!(sched.on_phy_rejected(f, source, &mut queues));
        assert_eq!(queues.get(QueueKind::Data(0)).peek().map(|f| f.seq), Some(1));

        let SlotDecision::Transmit { frame: f, source } = sched.decide(&ctx(2), &mut queues) else {
            panic!("expected transmit");
        };
        assert_eq!(f.seq, 1);
        assert!(!sched.on_phy_rejected(f, source, &mut queues));
        assert_eq!(sched.stats().phy_submit_drops, 1);
        assert_eq!(queues.get(QueueKind::Data(0)).peek().map(|f| f.seq), Some(2));
    }
}
