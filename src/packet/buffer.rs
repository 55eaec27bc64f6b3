//! The packet buffer: retains sent packets until acknowledged and
//! generates acknowledgments for received ones.
//!
//! State is kept per encryption level, since each level is its own
//! packet-number space. Received numbers feed two sets: `received` is
//! the all-time record (duplicate receipt is a set no-op), `pending`
//! holds numbers not yet covered by an ACK we sent and drains when one
//! goes out.

use crate::connection::State;
use crate::crypto::EncryptionLevel;
use crate::frames::{AckFrame, Frame};
use crate::packet::Packet;
use crate::pipeline::{Disposition, InboundHandler, OutboundHandler, PipelineContext};
use crate::types::PacketNumber;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

#[derive(Default)]
struct LevelState {
    /// Sent packets awaiting acknowledgment.
    sent: BTreeMap<PacketNumber, Packet>,
    /// Every packet number ever received at this level.
    received: BTreeSet<PacketNumber>,
    /// Received numbers not yet acknowledged by us.
    pending: BTreeSet<PacketNumber>,
    /// Largest packet number the peer has acknowledged.
    largest_acked: Option<PacketNumber>,
}

/// Per-connection packet buffer across all three levels.
#[derive(Default)]
pub struct PacketBuffer {
    initial: LevelState,
    handshake: LevelState,
    application: LevelState,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn level(&self, level: EncryptionLevel) -> &LevelState {
        match level {
            EncryptionLevel::Initial => &self.initial,
            EncryptionLevel::Handshake => &self.handshake,
            EncryptionLevel::OneRtt => &self.application,
        }
    }

    fn level_mut(&mut self, level: EncryptionLevel) -> &mut LevelState {
        match level {
            EncryptionLevel::Initial => &mut self.initial,
            EncryptionLevel::Handshake => &mut self.handshake,
            EncryptionLevel::OneRtt => &mut self.application,
        }
    }

    /// Whether acknowledgments are owed at `level`.
    pub fn has_pending_acks(&self, level: EncryptionLevel) -> bool {
        !self.level(level).pending.is_empty()
    }

    /// Build an ACK frame for the owed numbers at `level`, draining them.
    pub fn take_pending_ack(&mut self, level: EncryptionLevel) -> Option<AckFrame> {
        let state = self.level_mut(level);
        let ack = AckFrame::from_packet_numbers(0, state.pending.iter().copied());
        state.pending.clear();
        ack
    }

    /// Largest packet number the peer has acknowledged at `level`.
    pub fn largest_acked(&self, level: EncryptionLevel) -> Option<PacketNumber> {
        self.level(level).largest_acked
    }

    /// Number of sent packets still awaiting acknowledgment at `level`.
    pub fn unacked_count(&self, level: EncryptionLevel) -> usize {
        self.level(level).sent.len()
    }

    /// Frames from every unacknowledged sent packet, in send order, for
    /// re-emission at the current highest level. Acknowledgment and
    /// padding frames are not retransmittable.
    pub fn unacked_frames(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        for level in [EncryptionLevel::Initial, EncryptionLevel::Handshake, EncryptionLevel::OneRtt]
        {
            for packet in self.level(level).sent.values() {
                if let Some(payload) = packet.payload() {
                    frames.extend(
                        payload
                            .frames
                            .iter()
                            .filter(|f| !matches!(f, Frame::Ack(_) | Frame::Padding(_)))
                            .cloned(),
                    );
                }
            }
        }
        frames
    }

    fn on_ack(&mut self, level: EncryptionLevel, ack: &AckFrame) {
        let state = self.level_mut(level);
        let largest = ack.largest_acknowledged();
        if state.largest_acked.map_or(true, |current| largest > current) {
            state.largest_acked = Some(largest);
        }
        let cumulative = state.largest_acked.unwrap_or(0);
        state.sent.retain(|&pn, _| pn > cumulative && !ack.acknowledges(pn));
    }
}

impl InboundHandler for PacketBuffer {
    fn on_receive_packet(&mut self, packet: &Packet, ctx: &mut PipelineContext) -> Disposition {
        let (Some(pn), Some(level), Some(payload)) =
            (packet.packet_number(), packet.encryption_level(), packet.payload())
        else {
            return Disposition::Continue;
        };

        {
            let state = self.level_mut(level);
            if state.received.insert(pn) {
                state.pending.insert(pn);
            } else {
                trace!(packet_number = pn, "duplicate packet number");
            }
        }

        for frame in &payload.frames {
            if let Frame::Ack(ack) = frame {
                self.on_ack(level, ack);
            }
        }

        // Acknowledgments piggyback on handshake packets; once the
        // handshake is over an ack-eliciting packet gets an immediate
        // ACK-only reply if nothing else goes out first.
        if payload.is_ack_eliciting()
            && matches!(ctx.state(), State::Ready | State::Closing | State::Closed)
        {
            ctx.flush_acks(level);
        }

        Disposition::Continue
    }
}

impl OutboundHandler for PacketBuffer {
    fn before_send_packet(&mut self, packet: &mut Packet, _ctx: &mut PipelineContext)
        -> Disposition {
        let (Some(pn), Some(level)) = (packet.packet_number(), packet.encryption_level()) else {
            return Disposition::Continue;
        };

        if let Some(ack) = self.take_pending_ack(level) {
            if let Some(payload) = packet.payload_mut() {
                payload.frames.insert(0, Frame::Ack(ack));
            }
        }

        self.level_mut(level).sent.insert(pn, packet.clone());
        Disposition::Continue
    }
}
