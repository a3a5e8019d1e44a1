#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flyweight::{
    ControlCommand, ControllerListener, DeviceRegistry, ErrorKind, NetAddress, NetGuid,
    NetworkDevice, NetworkId, Packet, Result, Transport,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

type Responder = Box<dyn Fn(&Packet) -> Vec<Packet> + Send + Sync>;

/// A transport that records what is sent and replays whatever the test injects.
pub struct MockTransport {
    started: AtomicBool,
    starts: AtomicUsize,
    resets: AtomicUsize,
    sent: Mutex<Vec<(Instant, Packet)>>,
    inbound: mpsc::UnboundedSender<Packet>,
    received: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    responder: Option<Responder>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Every sent packet is also handed to `responder`, and whatever it returns is received.
    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&Packet) -> Vec<Packet> + Send + Sync + 'static,
    {
        Arc::new(Self::build(Some(Box::new(responder))))
    }

    fn build(responder: Option<Responder>) -> Self {
        let (inbound, received) = mpsc::unbounded_channel();
        Self {
            started: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            inbound,
            received: tokio::sync::Mutex::new(received),
            responder,
        }
    }

    pub fn inject(&self, packet: Packet) {
        let _ = self.inbound.send(packet);
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, packet)| packet.clone())
            .collect()
    }

    /// When the first sent packet matching `predicate` went out.
    pub fn sent_at<F>(&self, predicate: F) -> Option<Instant>
    where
        F: Fn(&Packet) -> bool,
    {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|(_, packet)| predicate(packet))
            .map(|(at, _)| *at)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_matching<F>(&self, predicate: F) -> Vec<Packet>
    where
        F: Fn(&Packet) -> bool,
    {
        self.sent().into_iter().filter(|p| predicate(p)).collect()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Waits up to two seconds for a sent packet matching `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Packet
    where
        F: Fn(&Packet) -> bool,
    {
        for _ in 0..400 {
            if let Some(packet) = self.sent().into_iter().find(|p| predicate(p)) {
                return packet;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected packet was never sent; sent {:#?}", self.sent());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.stop().await;
        self.start().await
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        if !self.is_started() {
            return Err(ErrorKind::NotStarted.into());
        }
        self.sent
            .lock()
            .unwrap()
            .push((Instant::now(), packet.clone()));
        if let Some(responder) = &self.responder {
            for response in responder(packet) {
                self.inject(response);
            }
        }
        Ok(())
    }

    async fn receive_packet(&self, network_id: NetworkId) -> Result<Option<Packet>> {
        if !self.is_started() {
            return Ok(None);
        }
        let mut received = self.received.lock().await;
        match tokio::time::timeout(Duration::from_millis(10), received.recv()).await {
            Ok(Some(packet)) => {
                if packet.network_id == network_id
                    || packet.network_id == NetworkId::ZERO
                    || packet.network_id == NetworkId::BROADCAST
                {
                    Ok(Some(packet))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    devices: Mutex<HashMap<NetGuid, NetworkDevice>>,
    changes: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }

    pub fn stored(&self, guid: &NetGuid) -> Option<NetworkDevice> {
        self.devices.lock().unwrap().get(guid).cloned()
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn find_device_by_guid(&self, guid: &NetGuid) -> Option<NetworkDevice> {
        self.stored(guid)
    }

    fn find_device_by_address(&self, address: NetAddress) -> Option<NetworkDevice> {
        self.devices
            .lock()
            .unwrap()
            .values()
            .find(|device| device.address == Some(address))
            .cloned()
    }

    fn on_device_changed(&self, device: &NetworkDevice, _persistent_fields_changed: bool) {
        self.changes.fetch_add(1, Ordering::SeqCst);
        self.devices
            .lock()
            .unwrap()
            .insert(device.guid, device.clone());
    }
}

#[derive(Default)]
pub struct RecordingListener {
    allowed: HashSet<NetGuid>,
    pub active: Mutex<Vec<NetGuid>>,
    pub lost: Mutex<Vec<NetGuid>>,
    pub controls: Mutex<Vec<(NetAddress, ControlCommand)>>,
}

impl RecordingListener {
    pub fn allowing(guids: &[NetGuid]) -> Arc<Self> {
        Arc::new(Self {
            allowed: guids.iter().copied().collect(),
            ..Default::default()
        })
    }

    pub fn active(&self) -> Vec<NetGuid> {
        self.active.lock().unwrap().clone()
    }

    pub fn controls(&self) -> Vec<(NetAddress, ControlCommand)> {
        self.controls.lock().unwrap().clone()
    }
}

impl ControllerListener for RecordingListener {
    fn can_device_associate(&self, guid: &NetGuid) -> bool {
        self.allowed.contains(guid)
    }

    fn on_device_lost(&self, device: &NetworkDevice) {
        self.lost.lock().unwrap().push(device.guid);
    }

    fn on_device_became_active(&self, device: &NetworkDevice) {
        self.active.lock().unwrap().push(device.guid);
    }

    fn on_control_command(
        &self,
        source: NetAddress,
        _device: Option<&NetworkDevice>,
        command: &ControlCommand,
    ) {
        self.controls
            .lock()
            .unwrap()
            .push((source, command.clone()));
    }
}
