use std::collections::{HashMap, VecDeque};

use flyweight_helpers::{Attempts, NonZeroId, RetryPolicy, Verdict};
use tokio::time::Instant;

use crate::{AckId, AckState, ErrorKind, NetAddress, Packet, Result, ACK_DATA_BYTES};

struct Pending {
    packet: Packet,
    attempts: Attempts,
}

impl Pending {
    fn transmit(&mut self, now: Instant) -> Packet {
        self.attempts.mark_sent(now);
        self.packet.sent_at = Some(now);
        self.packet.send_count = self.packet.send_count.saturating_add(1);
        self.packet.clone()
    }
}

/// Result of one pass over the pending queues.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Packets to put on the air, first transmissions and retries alike.
    pub transmit: Vec<Packet>,
    /// Packets that ran out of retries, marked `NoResponse`.
    pub exhausted: Vec<Packet>,
}

/// A packet that was acknowledged, and the packet queued behind it that may now be sent.
#[derive(Debug)]
pub struct Acknowledged {
    pub packet: Packet,
    pub next: Option<Packet>,
}

/// Tracks packets awaiting acknowledgement, one FIFO per destination.
///
/// Only the head of each queue is ever on the air, so a destination never sees a packet before
/// the one queued ahead of it has been acknowledged or given up on.
pub struct AckEngine {
    queues: HashMap<NetAddress, VecDeque<Pending>>,
    ack_ids: NonZeroId,
    policy: RetryPolicy,
    capacity: usize,
}

impl AckEngine {
    pub fn new(policy: RetryPolicy, capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            ack_ids: NonZeroId::new(),
            policy,
            capacity,
        }
    }

    /// Assigns an ack id to `packet` and queues it for its destination.
    ///
    /// Returns true if the packet is at the head of its queue and should be transmitted now.
    /// Broadcast packets cannot be acknowledged: they get no ack id and are always sent.
    pub fn register(&mut self, packet: &mut Packet, now: Instant) -> Result<bool> {
        if packet.is_broadcast() {
            return Ok(true);
        }

        let capacity = self.capacity;
        let queue = self.queues.entry(packet.dst).or_default();
        if queue.len() >= capacity {
            return Err(ErrorKind::AckQueueFull(packet.dst).into());
        }

        packet.ack_id = self.ack_ids.next();
        packet.ack_state = AckState::Pending;

        let mut pending = Pending {
            packet: packet.clone(),
            attempts: Attempts::new(),
        };
        let head = queue.is_empty();
        if head {
            let sent_at = packet.scheduled_at.unwrap_or(now);
            *packet = pending.transmit(sent_at);
        }
        queue.push_back(pending);

        Ok(head)
    }

    /// Matches an ack from `src` against its queue.
    pub fn acknowledge(
        &mut self,
        src: NetAddress,
        ack_id: AckId,
        data: [u8; ACK_DATA_BYTES],
        now: Instant,
    ) -> Option<Acknowledged> {
        let queue = self.queues.get_mut(&src)?;
        let position = queue
            .iter()
            .position(|pending| pending.packet.ack_id == ack_id)?;
        let mut packet = queue.remove(position)?.packet;
        packet.ack_state = AckState::Succeeded;
        packet.ack_data = Some(data);

        let next = match queue.front_mut() {
            Some(head) if head.attempts.sent_at().is_none() => Some(head.transmit(now)),
            _ => None,
        };
        if queue.is_empty() {
            self.queues.remove(&src);
        }

        Some(Acknowledged { packet, next })
    }

    pub fn sweep(&mut self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();

        for queue in self.queues.values_mut() {
            while let Some(head) = queue.front_mut() {
                match head.attempts.verdict(&self.policy, now) {
                    Verdict::Wait => break,
                    Verdict::Send | Verdict::Resend => {
                        sweep.transmit.push(head.transmit(now));
                        break;
                    }
                    Verdict::Exhausted => {
                        if let Some(pending) = queue.pop_front() {
                            let mut packet = pending.packet;
                            packet.ack_state = AckState::NoResponse;
                            sweep.exhausted.push(packet);
                        }
                    }
                }
            }
        }

        self.queues.retain(|_, queue| !queue.is_empty());
        sweep
    }

    /// Forgets everything pending for `dst`. Returns how many packets were dropped.
    pub fn clear(&mut self, dst: NetAddress) -> usize {
        self.queues.remove(&dst).map_or(0, |queue| queue.len())
    }

    pub fn pending(&self, dst: NetAddress) -> usize {
        self.queues.get(&dst).map_or(0, |queue| queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{Command, ControlCommand, NetworkId};

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn engine() -> AckEngine {
        AckEngine::new(RetryPolicy::new(TIMEOUT, 5), 10)
    }

    fn packet(dst: NetAddress, button: u8) -> Packet {
        Packet::new(
            NetworkId::DEFAULT,
            NetAddress::GATEWAY,
            dst,
            Command::Control(ControlCommand::ButtonPress { button, value: 1 }),
        )
    }

    fn button(packet: &Packet) -> u8 {
        match packet.command() {
            Some(Command::Control(ControlCommand::ButtonPress { button, .. })) => *button,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn broadcast_is_never_tracked() {
        let mut engine = engine();
        let now = Instant::now();

        let mut to_everyone = packet(NetAddress::BROADCAST, 1);
        assert!(engine.register(&mut to_everyone, now).unwrap());
        assert_eq!(to_everyone.ack_id, 0);
        assert_eq!(to_everyone.ack_state, AckState::None);

        let mut to_every_network = packet(NetAddress(4), 1);
        to_every_network.network_id = NetworkId::BROADCAST;
        assert!(engine.register(&mut to_every_network, now).unwrap());
        assert_eq!(to_every_network.ack_id, 0);

        assert!(engine.is_empty());
    }

    #[test]
    fn ack_ids_skip_zero() {
        let mut engine = engine();
        let now = Instant::now();
        for _ in 0..300 {
            let mut p = packet(NetAddress(1), 0);
            engine.register(&mut p, now).unwrap();
            assert_ne!(p.ack_id, 0);
            let ack_id = p.ack_id;
            engine.acknowledge(NetAddress(1), ack_id, [0; 8], now).unwrap();
        }
    }

    #[test]
    fn retries_exactly_then_gives_up() {
        let mut engine = engine();
        let mut now = Instant::now();
        let dst = NetAddress(7);

        let mut p = packet(dst, 1);
        let mut transmissions = 0;
        if engine.register(&mut p, now).unwrap() {
            transmissions += 1;
        }

        let mut exhausted = Vec::new();
        for _ in 0..20 {
            now += TIMEOUT + Duration::from_millis(1);
            let sweep = engine.sweep(now);
            transmissions += sweep.transmit.len();
            exhausted.extend(sweep.exhausted);
        }

        // One transmission plus five retries.
        assert_eq!(transmissions, 6);
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].ack_state, AckState::NoResponse);
        assert_eq!(exhausted[0].send_count, 6);
        assert_eq!(engine.pending(dst), 0);
    }

    #[test]
    fn fifo_per_destination() {
        let mut engine = engine();
        let mut now = Instant::now();
        let dst = NetAddress(3);

        let mut first = packet(dst, 1);
        let mut second = packet(dst, 2);
        assert!(engine.register(&mut first, now).unwrap());
        assert!(!engine.register(&mut second, now).unwrap());

        // Retries only ever concern the head.
        for _ in 0..3 {
            now += TIMEOUT + Duration::from_millis(1);
            let sweep = engine.sweep(now);
            assert_eq!(sweep.transmit.len(), 1);
            assert_eq!(button(&sweep.transmit[0]), 1);
        }

        let acked = engine
            .acknowledge(dst, first.ack_id, [9; 8], now)
            .unwrap();
        assert_eq!(acked.packet.ack_state, AckState::Succeeded);
        assert_eq!(acked.packet.ack_data, Some([9; 8]));
        let next = acked.next.unwrap();
        assert_eq!(button(&next), 2);
        assert_eq!(next.ack_id, second.ack_id);
    }

    #[test]
    fn next_head_sent_after_exhaustion() {
        let mut engine = AckEngine::new(RetryPolicy::new(TIMEOUT, 0), 10);
        let mut now = Instant::now();
        let dst = NetAddress(3);

        engine.register(&mut packet(dst, 1), now).unwrap();
        engine.register(&mut packet(dst, 2), now).unwrap();

        now += TIMEOUT + Duration::from_millis(1);
        let sweep = engine.sweep(now);
        assert_eq!(sweep.exhausted.len(), 1);
        assert_eq!(button(&sweep.exhausted[0]), 1);
        assert_eq!(sweep.transmit.len(), 1);
        assert_eq!(button(&sweep.transmit[0]), 2);
    }

    #[test]
    fn unmatched_ack_is_ignored() {
        let mut engine = engine();
        let now = Instant::now();
        let mut p = packet(NetAddress(3), 1);
        engine.register(&mut p, now).unwrap();

        assert!(engine
            .acknowledge(NetAddress(3), p.ack_id.wrapping_add(1), [0; 8], now)
            .is_none());
        assert!(engine.acknowledge(NetAddress(4), p.ack_id, [0; 8], now).is_none());
        assert_eq!(engine.pending(NetAddress(3)), 1);
    }

    #[test]
    fn rejects_when_queue_full() {
        let mut engine = AckEngine::new(RetryPolicy::new(TIMEOUT, 5), 2);
        let now = Instant::now();
        engine.register(&mut packet(NetAddress(3), 1), now).unwrap();
        engine.register(&mut packet(NetAddress(3), 2), now).unwrap();

        let error = engine
            .register(&mut packet(NetAddress(3), 3), now)
            .unwrap_err();
        assert!(matches!(error.kind, ErrorKind::AckQueueFull(NetAddress(3))));
    }

    #[test]
    fn clear_drops_queue() {
        let mut engine = engine();
        let now = Instant::now();
        engine.register(&mut packet(NetAddress(3), 1), now).unwrap();
        engine.register(&mut packet(NetAddress(3), 2), now).unwrap();

        assert_eq!(engine.clear(NetAddress(3)), 2);
        assert!(engine.sweep(now + Duration::from_secs(1)).transmit.is_empty());
    }
}
