//! CR/CC voice reservation for the MV slot

use std::time::Duration;
use tokio::time::Instant;
use log::{debug, info, warn};

use tacmesh_core::{DataType, Frame, NodeId, Priority, SeqNo, VoiceControl, BROADCAST};

use crate::queue::{QueueKind, QueueSet};
use crate::RadioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Inactive,
    CrSent { since: Instant },
    ActiveTx { expires: Instant },
}

impl VoiceState {
    pub fn name(&self) -> &'static str {
        match self {
            VoiceState::Inactive => "INACTIVE",
            VoiceState::CrSent { .. } => "CR_SENT",
            VoiceState::ActiveTx { .. } => "ACTIVE_TX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    PttPress,
    PttRelease,
    CcReceived,
    GrantExpired,
    CrTimeout,
}

impl VoiceEvent {
    fn name(&self) -> &'static str {
        match self {
            VoiceEvent::PttPress => "PTT_press",
            VoiceEvent::PttRelease => "PTT_release",
            VoiceEvent::CcReceived => "CC_received",
            VoiceEvent::GrantExpired => "grant_expired",
            VoiceEvent::CrTimeout => "CR_timeout",
        }
    }

    /// Timer events are generated by the FSM itself, so an illegal one is a bug.
    fn is_internal(&self) -> bool {
        matches!(self, VoiceEvent::GrantExpired | VoiceEvent::CrTimeout)
    }
}

/// One node's reservation of the MV slot.
#[derive(Debug)]
pub struct VoiceReservation {
    own_id: NodeId,
    state: VoiceState,
    grant: Duration,
    cr_timeout: Duration,
    /// Seq of the CR queued by the last press, until a CC answers it.
    pending_cr: Option<SeqNo>,
}

impl VoiceReservation {
    pub fn new(own_id: NodeId, grant: Duration, cr_timeout: Duration) -> Self {
        Self {
            own_id,
            state: VoiceState::Inactive,
            grant,
            cr_timeout,
            pending_cr: None,
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, VoiceState::ActiveTx { .. })
    }

    pub fn is_idle(&self) -> bool {
        self.state == VoiceState::Inactive
    }

    pub fn grant(&self) -> Duration {
        self.grant
    }

    /// Queues a CR and moves to `CR_SENT`. A full `data_queue[0]` leaves the state untouched.
    pub fn ptt_press(&mut self, now: Instant, seq: SeqNo, queues: &mut QueueSet) -> Result<(), RadioError> {
        if self.state != VoiceState::Inactive {
            return Err(self.reject(VoiceEvent::PttPress));
        }
        let body = VoiceControl {
            requester: self.own_id,
            grant_ms: self.grant.as_millis().min(u16::MAX as u128) as u16,
        };
        let cr = Frame {
            source: self.own_id,
            destination: BROADCAST,
            next_hop: BROADCAST,
            ttl: 1,
            priority: Priority::VOICE,
            data_type: DataType::ControlRequest,
            seq,
            timestamp: 0,
            payload: body.encode()?,
        };
        queues.get_mut(QueueKind::Data(0)).enqueue(cr)?;
        info!("Node {} PTT pressed, CR queued", self.own_id);
        self.state = VoiceState::CrSent { since: now };
        self.pending_cr = Some(seq);
        Ok(())
    }

    /// Returns `true` when the CC completed our handshake. A CC outside
    /// `CR_SENT` is a late or duplicate confirm and is ignored.
    pub fn cc_received(&mut self, now: Instant) -> bool {
        match self.state {
            VoiceState::CrSent { .. } => {
                self.state = VoiceState::ActiveTx { expires: now + self.grant };
                self.pending_cr = None;
                info!("Node {} voice grant active for {:?}", self.own_id, self.grant);
                true
            }
            other => {
                debug!("Node {} ignoring CC in {}", self.own_id, other.name());
                false
            }
        }
    }

    /// Ends the reservation from any state, flushing queued analog voice.
    pub fn ptt_release(&mut self, queues: &mut QueueSet) -> usize {
        self.finish(VoiceEvent::PttRelease, queues)
    }

    /// Fires grant expiry or CR timeout when due.
    pub fn poll(&mut self, now: Instant, queues: &mut QueueSet) -> Option<VoiceEvent> {
        let event = match self.state {
            VoiceState::CrSent { since } if now.saturating_duration_since(since) >= self.cr_timeout => VoiceEvent::CrTimeout,
            VoiceState::ActiveTx { expires } if now >= expires => VoiceEvent::GrantExpired,
            _ => return None,
        };
        self.apply_timer(event, queues);
        Some(event)
    }

    fn apply_timer(&mut self, event: VoiceEvent, queues: &mut QueueSet) {
        let legal = matches!(
            (self.state, event),
            (VoiceState::CrSent { .. }, VoiceEvent::CrTimeout) | (VoiceState::ActiveTx { .. }, VoiceEvent::GrantExpired)
        );
        if !legal {
            self.reject(event);
            return;
        }
        self.finish(event, queues);
    }

    fn finish(&mut self, event: VoiceEvent, queues: &mut QueueSet) -> usize {
        if let Some(seq) = self.pending_cr.take() {
            let own_id = self.own_id;
            let withdrawn = queues.get_mut(QueueKind::Data(0)).remove_where(|f| {
                f.source == own_id && f.seq == seq && f.data_type == DataType::ControlRequest
            });
            if withdrawn > 0 {
                debug!("Node {} withdrew unsent CR {}", self.own_id, seq);
            }
        }
        let flushed = queues.get_mut(QueueKind::AnalogVoice).clear();
        if self.state != VoiceState::Inactive {
            debug!(
                "Node {} voice {} -> INACTIVE on {}, {} voice frames flushed",
                self.own_id,
                self.state.name(),
                event.name(),
                flushed
            );
        }
        self.state = VoiceState::Inactive;
        flushed
    }

    fn reject(&self, event: VoiceEvent) -> RadioError {
        warn!("Node {} illegal voice transition {} in {}", self.own_id, event.name(), self.state.name());
        debug_assert!(!event.is_internal(), "voice FSM generated {} in {}", event.name(), self.state.name());
        RadioError::FsmIllegalTransition {
            state: self.state.name(),
            event: event.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn voice_frame(seq: SeqNo) -> Frame {
        Frame {
            source: 1,
            destination: BROADCAST,
            next_hop: BROADCAST,
            ttl: 1,
            priority: Priority::PTT,
            data_type: DataType::AnalogVoice,
            seq,
            timestamp: 0,
            payload: Bytes::from_static(b"pcm"),
        }
    }

    fn fsm() -> VoiceReservation {
        VoiceReservation::new(1, Duration::from_millis(3000), Duration::from_millis(1000))
    }

    #[test]
    fn test_press_queues_cr() {
        let mut queues = QueueSet::new(10);
        let mut voice = fsm();
        voice.ptt_press(Instant::now(), 1, &mut queues).unwrap();
        assert!(matches!(voice.state(), VoiceState::CrSent { .. }));
        let cr = queues.get(QueueKind::Data(0)).peek().unwrap();
        assert_eq!(cr.data_type, DataType::ControlRequest);
        assert_eq!(cr.priority, Priority::VOICE);
        assert_eq!(VoiceControl::decode(&cr.payload).unwrap().requester, 1);
    }

    #[test]
    fn test_press_with_full_queue_stays_inactive() {
        let mut queues = QueueSet::new(1);
        queues
            .get_mut(QueueKind::Data(0))
            .enqueue(Frame { priority: Priority::VOICE, ..voice_frame(99) })
            .unwrap();
        let mut voice = fsm();
        assert_eq!(voice.ptt_press(Instant::now(), 1, &mut queues), Err(RadioError::QueueFull));
        assert!(voice.is_idle());
    }

    #[test]
    fn test_double_press_is_guarded() {
        let mut queues = QueueSet::new(10);
        let mut voice = fsm();
        voice.ptt_press(Instant::now(), 1, &mut queues).unwrap();
        assert!(matches!(
            voice.ptt_press(Instant::now(), 2, &mut queues),
            Err(RadioError::FsmIllegalTransition { .. })
        ));
        assert_eq!(queues.get(QueueKind::Data(0)).len(), 1);
    }

    #[test]
    fn test_cc_only_counts_after_cr() {
        let mut voice = fsm();
        assert!(!voice.cc_received(Instant::now()));
        assert!(voice.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_expiry_flushes_voice() {
        let mut queues = QueueSet::new(10);
        let mut voice = fsm();
        let t0 = Instant::now();
        voice.ptt_press(t0, 1, &mut queues).unwrap();
        assert!(voice.cc_received(t0 + Duration::from_millis(50)));
        queues.get_mut(QueueKind::AnalogVoice).enqueue(voice_frame(2)).unwrap();

        assert_eq!(voice.poll(t0 + Duration::from_millis(2000), &mut queues), None);
        assert_eq!(
            voice.poll(t0 + Duration::from_millis(3050), &mut queues),
            Some(VoiceEvent::GrantExpired)
        );
        assert!(voice.is_idle());
        assert!(queues.get(QueueKind::AnalogVoice).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cr_timeout_returns_to_inactive() {
        let mut queues = QueueSet::new(10);
        let mut voice = fsm();
        let t0 = Instant::now();
        voice.ptt_press(t0, 1, &mut queues).unwrap();
        assert_eq!(voice.poll(t0 + Duration::from_millis(1000), &mut queues), Some(VoiceEvent::CrTimeout));
        assert!(voice.is_idle());
        assert!(queues.get(QueueKind::Data(0)).is_empty());
        // a CC arriving after the timeout is late and ignored
        assert!(!voice.cc_received(t0 + Duration::from_millis(1100)));
    }

    #[test]
    fn test_release_from_any_state() {
        let mut queues = QueueSet::new(10);
        let mut voice = fsm();
        voice.ptt_release(&mut queues);
        assert!(voice.is_idle());
        voice.ptt_press(Instant::now(), 1, &mut queues).unwrap();
        voice.cc_received(Instant::now());
        queues.get_mut(QueueKind::AnalogVoice).enqueue(voice_frame(3)).unwrap();
        assert_eq!(voice.ptt_release(&mut queues), 1);
        assert!(voice.is_idle());
    }

    #[test]
    fn test_release_withdraws_unsent_cr_only() {
        let mut queues = QueueSet::new(10);
        let peer_cc = Frame {
            source: 2,
            destination: 3,
            priority: Priority::VOICE,
            data_type: DataType::ControlConfirm,
            ..voice_frame(1)
        };
        queues.get_mut(QueueKind::Data(0)).enqueue(peer_cc).unwrap();
        let mut voice = fsm();
        voice.ptt_press(Instant::now(), 1, &mut queues).unwrap();
        assert_eq!(queues.get(QueueKind::Data(0)).len(), 2);

        voice.ptt_release(&mut queues);
        let left: Vec<_> = queues.get(QueueKind::Data(0)).iter().map(|f| f.data_type).collect();
        assert_eq!(left, vec![DataType::ControlConfirm]);
    }
}
