use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::{ErrorKind, Packet, Result};

const PUT_POLL: Duration = Duration::from_millis(1);

struct Slots {
    slots: Vec<Option<Packet>>,
    producer: usize,
    consumer: usize,
}

/// Fixed-size ring of packets waiting for the sender.
///
/// A producer that finds its slot still occupied waits for the sender to drain it, so nothing is
/// ever dropped.
pub struct SendBuffer {
    inner: Mutex<Slots>,
    filled: Notify,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Slots {
                slots: vec![None; capacity],
                producer: 0,
                consumer: 0,
            }),
            filled: Notify::new(),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.slots().slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots().slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `packet` in the next slot without waiting. Hands it back if the slot is taken.
    pub fn try_put(&self, packet: Packet) -> std::result::Result<(), Packet> {
        {
            let mut inner = self.slots();
            let producer = inner.producer;
            let len = inner.slots.len();
            if inner.slots[producer].is_some() {
                return Err(packet);
            }
            inner.slots[producer] = Some(packet);
            inner.producer = (producer + 1) % len;
        }
        self.filled.notify_one();
        Ok(())
    }

    /// Stores `packet`, polling until the slot frees up. Gives up once `running` is cleared.
    pub async fn put(&self, packet: Packet, running: &AtomicBool) -> Result<()> {
        let mut packet = packet;
        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(ErrorKind::Stopped.into());
            }
            match self.try_put(packet) {
                Ok(()) => return Ok(()),
                Err(returned) => packet = returned,
            }
            tokio::time::sleep(PUT_POLL).await;
        }
    }

    pub fn take(&self) -> Option<Packet> {
        let mut inner = self.slots();
        let consumer = inner.consumer;
        let len = inner.slots.len();
        let packet = inner.slots[consumer].take()?;
        inner.consumer = (consumer + 1) % len;
        Some(packet)
    }

    /// Resolves once something may have been put since the last call.
    pub async fn filled(&self) {
        self.filled.notified().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{Command, NetAddress, NetMgmtCommand, NetworkId};

    fn packet(number: u8) -> Packet {
        Packet::new(
            NetworkId::DEFAULT,
            NetAddress::GATEWAY,
            NetAddress::BROADCAST,
            Command::NetMgmt(NetMgmtCommand::IntfTest { number }),
        )
    }

    fn number(packet: &Packet) -> u8 {
        match packet.command() {
            Some(Command::NetMgmt(NetMgmtCommand::IntfTest { number })) => *number,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn preserves_order_across_wrap() {
        let buffer = SendBuffer::new(3);
        for round in 0..4u8 {
            buffer.try_put(packet(round * 2)).unwrap();
            buffer.try_put(packet(round * 2 + 1)).unwrap();
            assert_eq!(number(&buffer.take().unwrap()), round * 2);
            assert_eq!(number(&buffer.take().unwrap()), round * 2 + 1);
        }
        assert!(buffer.take().is_none());
    }

    #[test]
    fn full_buffer_refuses_without_dropping() {
        let buffer = SendBuffer::new(2);
        buffer.try_put(packet(1)).unwrap();
        buffer.try_put(packet(2)).unwrap();
        let refused = buffer.try_put(packet(3)).unwrap_err();
        assert_eq!(number(&refused), 3);
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn put_waits_for_space() {
        let buffer = Arc::new(SendBuffer::new(1));
        let running = Arc::new(AtomicBool::new(true));
        buffer.try_put(packet(1)).unwrap();

        let producer = {
            let buffer = buffer.clone();
            let running = running.clone();
            tokio::spawn(async move { buffer.put(packet(2), &running).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(number(&buffer.take().unwrap()), 1);

        producer.await.unwrap().unwrap();
        assert_eq!(number(&buffer.take().unwrap()), 2);
    }

    #[tokio::test]
    async fn put_gives_up_when_stopped() {
        let buffer = SendBuffer::new(1);
        let running = AtomicBool::new(true);
        buffer.try_put(packet(1)).unwrap();
        running.store(false, Ordering::SeqCst);

        let error = buffer.put(packet(2), &running).await.unwrap_err();
        assert!(matches!(error.kind, ErrorKind::Stopped));
    }
}
