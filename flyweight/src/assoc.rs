use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::{
    AckId, AssocAck, AssocCheck, AssocCommand, AssocReq, AssocResp, AssocStatus, Command,
    ControllerConfig, ControllerListener, DeviceRegistry, DeviceTable, NetAddress, NetGuid,
    NetworkDevice, NetworkDeviceState, NetworkId,
};

/// What the controller must do after an association request was accepted.
#[derive(Debug)]
pub struct ReqOutcome {
    /// The `AssocResp` to broadcast, unacknowledged, on the broadcast network.
    pub response: Command,
    pub device: NetworkDevice,
}

/// What the controller must do after an association check from a known device.
#[derive(Debug)]
pub struct CheckOutcome {
    /// The `AssocAck` to send back to the checking address, unacknowledged.
    pub reply: Command,
    pub device: NetworkDevice,
    pub became_active: bool,
}

struct Activation {
    guid: NetGuid,
    due: Instant,
}

/// The association state machine and the table of devices it manages.
///
/// Listener and registry callbacks are never made while the table is locked.
pub struct Associations {
    table: Mutex<DeviceTable>,
    activations: Mutex<Vec<Activation>>,
    registry: Arc<dyn DeviceRegistry>,
    listener: Arc<dyn ControllerListener>,
    network_id: NetworkId,
    sleep_seconds: u8,
    settle_delay: Duration,
    lost_timeout: Duration,
}

impl Associations {
    pub fn new(
        config: &ControllerConfig,
        registry: Arc<dyn DeviceRegistry>,
        listener: Arc<dyn ControllerListener>,
    ) -> Self {
        Self {
            table: Mutex::new(DeviceTable::new()),
            activations: Mutex::new(Vec::new()),
            registry,
            listener,
            network_id: config.network_id,
            sleep_seconds: config.sleep_seconds,
            settle_delay: config.settle_delay(),
            lost_timeout: config.device_lost_timeout(),
        }
    }

    fn table(&self) -> MutexGuard<'_, DeviceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn activations(&self) -> MutexGuard<'_, Vec<Activation>> {
        self.activations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn listener(&self) -> &Arc<dyn ControllerListener> {
        &self.listener
    }

    pub fn add_device(&self, device: NetworkDevice) {
        debug!("adding device {}", device);
        self.table().insert(device);
    }

    pub fn remove_device(&self, guid: &NetGuid) -> Option<NetworkDevice> {
        self.activations().retain(|activation| activation.guid != *guid);
        self.table().remove(guid)
    }

    pub fn device(&self, guid: &NetGuid) -> Option<NetworkDevice> {
        self.table().get(guid).cloned()
    }

    pub fn device_at(&self, address: NetAddress) -> Option<NetworkDevice> {
        self.table().by_address(address).cloned()
    }

    pub fn devices(&self) -> Vec<NetworkDevice> {
        self.table().devices().cloned().collect()
    }

    /// Records that something was heard from `address`.
    pub fn touch(&self, address: NetAddress, now: Instant) {
        if let Some(device) = self.table().by_address_mut(address) {
            device.last_contact = Some(now);
        }
    }

    /// Records an incoming ack id from `address`.
    ///
    /// Returns `None` for an unknown address, otherwise whether the packet is new and should be
    /// acted on.
    pub fn accept_ack_id(&self, address: NetAddress, ack_id: AckId) -> Option<bool> {
        let mut table = self.table();
        let device = table.by_address_mut(address)?;
        let new = device.is_ack_id_new(ack_id);
        device.last_incoming_ack_id = ack_id;
        Some(new)
    }

    /// Handles a device asking to join.
    ///
    /// A device already started at an address is told that address again and stays started.
    pub fn on_assoc_req(
        &self,
        src: NetAddress,
        req: &AssocReq,
        now: Instant,
    ) -> Option<ReqOutcome> {
        let guid = req.guid;
        if !self.listener.can_device_associate(&guid) {
            debug!("association from {} at {} not allowed", guid, src);
            return None;
        }

        let (device, persistent_fields_changed, started) = {
            let mut table = self.table();
            if table.get(&guid).is_none() {
                let device = self.registry.find_device_by_guid(&guid).unwrap_or_else(|| {
                    NetworkDevice {
                        sleep_seconds: self.sleep_seconds,
                        ..NetworkDevice::new(guid)
                    }
                });
                table.insert(device);
            }

            let previous = table.get(&guid)?.clone();
            let started =
                previous.state == NetworkDeviceState::Started && previous.address.is_some();
            if let Some(device) = table.get_mut(&guid) {
                if !started {
                    device.state = NetworkDeviceState::Setup;
                }
                device.hardware_version = req.hardware_version;
                device.firmware_version = req.firmware_version;
                device.last_contact = Some(now);
            }

            info!("device {} requested association: {:?}", guid, req);
            for flag in req.system_status.flags() {
                debug!(" status: {}", flag);
            }

            let address = match table.assign_address(&guid) {
                Some(address) => address,
                None => {
                    warn!("no free address for {}", guid);
                    return None;
                }
            };

            let device = table.get_mut(&guid)?;
            if !started {
                device.state = NetworkDeviceState::AssignSent;
            }
            let changed = previous.address != Some(address)
                || previous.hardware_version != device.hardware_version
                || previous.firmware_version != device.firmware_version;
            (device.clone(), changed, started)
        };

        if !started {
            let mut activations = self.activations();
            activations.retain(|activation| activation.guid != guid);
            activations.push(Activation {
                guid,
                due: now + self.settle_delay,
            });
        }

        self.registry
            .on_device_changed(&device, persistent_fields_changed);

        let response = Command::Assoc(AssocCommand::Resp(AssocResp {
            guid,
            address: device.address.unwrap_or(NetAddress::GATEWAY),
            network_id: self.network_id,
            sleep_seconds: device.sleep_seconds,
        }));
        Some(ReqOutcome { response, device })
    }

    /// Handles a device asking whether it is still associated.
    ///
    /// A device still waiting on its assignment is started right away; `clear_acks` is called
    /// with its address first so nothing queued for a previous association reaches it.
    pub fn on_assoc_check<F>(
        &self,
        src: NetAddress,
        check: &AssocCheck,
        now: Instant,
        clear_acks: F,
    ) -> Option<CheckOutcome>
    where
        F: FnOnce(NetAddress) -> usize,
    {
        let (device, became_active, battery_changed, status) = {
            let mut table = self.table();
            let device = match table.get_mut(&check.guid) {
                Some(device) => device,
                None => {
                    debug!("association check from unknown device {}", check.guid);
                    return None;
                }
            };
            info!("association check for {}", device);
            device.last_contact = Some(now);

            let battery_changed = device.last_battery_level != check.battery_level;
            device.last_battery_level = check.battery_level;

            let mut became_active = false;
            if device.state == NetworkDeviceState::AssignSent {
                if let Some(address) = device.address {
                    let cleared = clear_acks(address);
                    if cleared > 0 {
                        info!("cleared {} pending acks for {}", cleared, device);
                    }
                }
                device.state = NetworkDeviceState::Started;
                became_active = true;
            }

            let status = if device.state != NetworkDeviceState::Started {
                info!("{} not associated: state {:?}", device.guid, device.state);
                AssocStatus::NotAssociated
            } else if device.address != Some(src) {
                info!("{} not associated: checked from {}", device, src);
                AssocStatus::NotAssociated
            } else {
                AssocStatus::Associated
            };

            (device.clone(), became_active, battery_changed, status)
        };

        if became_active {
            self.activations()
                .retain(|activation| activation.guid != device.guid);
            self.listener.on_device_became_active(&device);
        }
        if became_active || battery_changed {
            self.registry.on_device_changed(&device, false);
        }

        let reply = Command::Assoc(AssocCommand::Ack(AssocAck {
            guid: check.guid,
            status,
        }));
        Some(CheckOutcome {
            reply,
            device,
            became_active,
        })
    }

    /// Starts devices whose settle delay ran out while they were still waiting on their
    /// assignment.
    pub fn activate_settled(&self, now: Instant) -> Vec<NetworkDevice> {
        let due: Vec<NetGuid> = {
            let mut activations = self.activations();
            let due = activations
                .iter()
                .filter(|activation| activation.due <= now)
                .map(|activation| activation.guid)
                .collect();
            activations.retain(|activation| activation.due > now);
            due
        };
        if due.is_empty() {
            return Vec::new();
        }

        let mut activated = Vec::new();
        {
            let mut table = self.table();
            for guid in &due {
                if let Some(device) = table.get_mut(guid) {
                    if device.state == NetworkDeviceState::AssignSent {
                        device.state = NetworkDeviceState::Started;
                        activated.push(device.clone());
                    }
                }
            }
        }

        for device in &activated {
            info!("device {} active", device);
            self.listener.on_device_became_active(device);
            self.registry.on_device_changed(device, false);
        }
        activated
    }

    /// Marks started devices that have gone quiet for too long as lost.
    pub fn sweep_lost(&self, now: Instant) -> Vec<NetworkDevice> {
        let lost: Vec<NetworkDevice> = {
            let mut table = self.table();
            table
                .devices_mut()
                .filter(|device| device.state == NetworkDeviceState::Started)
                .filter(|device| match device.last_contact {
                    Some(contact) => now.saturating_duration_since(contact) > self.lost_timeout,
                    None => false,
                })
                .map(|device| {
                    device.state = NetworkDeviceState::Lost;
                    device.clone()
                })
                .collect()
        };

        for device in &lost {
            warn!("device {} lost", device);
            self.listener.on_device_lost(device);
            self.registry.on_device_changed(device, false);
        }
        lost
    }

    /// Takes every device through `Stopped` to `Terminated`.
    pub fn terminate_all(&self) {
        self.activations().clear();
        for state in &[NetworkDeviceState::Stopped, NetworkDeviceState::Terminated] {
            let changed: Vec<NetworkDevice> = {
                let mut table = self.table();
                table
                    .devices_mut()
                    .map(|device| {
                        device.state = *state;
                        device.clone()
                    })
                    .collect()
            };

            for device in &changed {
                self.registry.on_device_changed(device, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::SystemStatus;

    #[derive(Default)]
    struct Recorder {
        allowed: HashSet<NetGuid>,
        active: Mutex<Vec<NetGuid>>,
        lost: Mutex<Vec<NetGuid>>,
        changed: Mutex<Vec<(NetworkDevice, bool)>>,
        known: Vec<NetworkDevice>,
    }

    impl DeviceRegistry for Recorder {
        fn find_device_by_guid(&self, guid: &NetGuid) -> Option<NetworkDevice> {
            self.known.iter().find(|device| device.guid == *guid).cloned()
        }

        fn find_device_by_address(&self, address: NetAddress) -> Option<NetworkDevice> {
            self.known
                .iter()
                .find(|device| device.address == Some(address))
                .cloned()
        }

        fn on_device_changed(&self, device: &NetworkDevice, persistent_fields_changed: bool) {
            self.changed
                .lock()
                .unwrap()
                .push((device.clone(), persistent_fields_changed));
        }
    }

    impl ControllerListener for Recorder {
        fn can_device_associate(&self, guid: &NetGuid) -> bool {
            self.allowed.contains(guid)
        }

        fn on_device_lost(&self, device: &NetworkDevice) {
            self.lost.lock().unwrap().push(device.guid);
        }

        fn on_device_became_active(&self, device: &NetworkDevice) {
            self.active.lock().unwrap().push(device.guid);
        }
    }

    fn guid() -> NetGuid {
        NetGuid(*b"DEVICE01")
    }

    fn setup(known: Vec<NetworkDevice>) -> (Arc<Recorder>, Associations) {
        let recorder = Arc::new(Recorder {
            allowed: vec![guid()].into_iter().collect(),
            known,
            ..Default::default()
        });
        let associations =
            Associations::new(&ControllerConfig::default(), recorder.clone(), recorder.clone());
        (recorder, associations)
    }

    fn req() -> AssocReq {
        AssocReq {
            guid: guid(),
            hardware_version: [1, 0, 0, 0],
            firmware_version: [2, 0, 0, 0],
            radio_protocol_version: 1,
            system_status: SystemStatus(SystemStatus::POR),
        }
    }

    fn check(battery_level: u8) -> AssocCheck {
        AssocCheck {
            guid: guid(),
            battery_level,
        }
    }

    fn status(outcome: &CheckOutcome) -> AssocStatus {
        match outcome.reply {
            Command::Assoc(AssocCommand::Ack(ack)) => ack.status,
            ref other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn refuses_disallowed_device() {
        let (recorder, associations) = setup(Vec::new());
        let mut stranger = req();
        stranger.guid = NetGuid(*b"STRANGER");

        assert!(associations
            .on_assoc_req(NetAddress::GATEWAY, &stranger, Instant::now())
            .is_none());
        assert!(associations.devices().is_empty());
        assert!(recorder.changed.lock().unwrap().is_empty());
    }

    #[test]
    fn request_assigns_address_and_responds() {
        let (recorder, associations) = setup(Vec::new());
        let outcome = associations
            .on_assoc_req(NetAddress::GATEWAY, &req(), Instant::now())
            .unwrap();

        assert_eq!(outcome.device.state, NetworkDeviceState::AssignSent);
        assert_eq!(outcome.device.address, Some(NetAddress(1)));
        assert_eq!(outcome.device.hardware_version, [1, 0, 0, 0]);
        match outcome.response {
            Command::Assoc(AssocCommand::Resp(resp)) => {
                assert_eq!(resp.guid, guid());
                assert_eq!(resp.address, NetAddress(1));
                assert_eq!(resp.network_id, NetworkId::DEFAULT);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(recorder.changed.lock().unwrap().len(), 1);
        assert!(recorder.changed.lock().unwrap()[0].1);
    }

    #[test]
    fn registry_address_is_kept() {
        let known = NetworkDevice::with_address(guid(), NetAddress(42));
        let (_, associations) = setup(vec![known]);
        let outcome = associations
            .on_assoc_req(NetAddress(42), &req(), Instant::now())
            .unwrap();
        assert_eq!(outcome.device.address, Some(NetAddress(42)));
    }

    #[test]
    fn repeated_requests_are_idempotent() {
        let (recorder, associations) = setup(Vec::new());
        let start = Instant::now();

        let first = associations.on_assoc_req(NetAddress::GATEWAY, &req(), start).unwrap();
        let second = associations
            .on_assoc_req(NetAddress::GATEWAY, &req(), start + Duration::from_millis(100))
            .unwrap();

        assert_eq!(first.device.address, second.device.address);
        assert_eq!(associations.devices().len(), 1);

        // The second request restarted the settle delay.
        assert!(associations
            .activate_settled(start + Duration::from_millis(250))
            .is_empty());
        assert_eq!(
            associations
                .activate_settled(start + Duration::from_millis(301))
                .len(),
            1
        );
        assert!(associations
            .activate_settled(start + Duration::from_secs(10))
            .is_empty());
        assert_eq!(*recorder.active.lock().unwrap(), vec![guid()]);
    }

    #[test]
    fn repeated_requests_keep_started_device_associated() {
        let (recorder, associations) = setup(Vec::new());
        let now = Instant::now();
        associations.on_assoc_req(NetAddress::GATEWAY, &req(), now).unwrap();
        associations
            .on_assoc_check(NetAddress(1), &check(80), now, |_| 0)
            .unwrap();
        assert_eq!(
            associations.device(&guid()).unwrap().state,
            NetworkDeviceState::Started
        );

        for _ in 0..2 {
            let outcome = associations
                .on_assoc_req(NetAddress::GATEWAY, &req(), now)
                .unwrap();
            assert_eq!(outcome.device.address, Some(NetAddress(1)));
            assert!(outcome.device.state >= NetworkDeviceState::Setup);
        }
        assert_eq!(
            associations.device(&guid()).unwrap().state,
            NetworkDeviceState::Started
        );
        assert!(associations
            .activate_settled(now + Duration::from_secs(1))
            .is_empty());

        let outcome = associations
            .on_assoc_check(NetAddress(1), &check(80), now, |_| panic!("acks cleared"))
            .unwrap();
        assert!(!outcome.became_active);
        assert_eq!(status(&outcome), AssocStatus::Associated);
        assert_eq!(*recorder.active.lock().unwrap(), vec![guid()]);
    }

    #[test]
    fn check_starts_assigned_device_once() {
        let (recorder, associations) = setup(Vec::new());
        let now = Instant::now();
        associations.on_assoc_req(NetAddress::GATEWAY, &req(), now).unwrap();

        let mut cleared = Vec::new();
        let outcome = associations
            .on_assoc_check(NetAddress(1), &check(80), now, |address| {
                cleared.push(address);
                2
            })
            .unwrap();
        assert!(outcome.became_active);
        assert_eq!(status(&outcome), AssocStatus::Associated);
        assert_eq!(cleared, vec![NetAddress(1)]);

        // The settle timer no longer fires for it.
        assert!(associations
            .activate_settled(now + Duration::from_secs(1))
            .is_empty());

        let again = associations
            .on_assoc_check(NetAddress(1), &check(80), now, |_| panic!("cleared twice"))
            .unwrap();
        assert!(!again.became_active);
        assert_eq!(status(&again), AssocStatus::Associated);
        assert_eq!(*recorder.active.lock().unwrap(), vec![guid()]);
    }

    #[test]
    fn check_from_wrong_address_is_not_associated() {
        let (_, associations) = setup(Vec::new());
        let now = Instant::now();
        associations.on_assoc_req(NetAddress::GATEWAY, &req(), now).unwrap();
        associations.activate_settled(now + Duration::from_secs(1));

        let outcome = associations
            .on_assoc_check(NetAddress(9), &check(80), now, |_| 0)
            .unwrap();
        assert_eq!(status(&outcome), AssocStatus::NotAssociated);
    }

    #[test]
    fn check_for_lost_device_is_not_associated() {
        let (recorder, associations) = setup(Vec::new());
        let now = Instant::now();
        associations.on_assoc_req(NetAddress::GATEWAY, &req(), now).unwrap();
        associations.activate_settled(now + Duration::from_secs(1));

        let later = now + Duration::from_secs(301);
        assert_eq!(associations.sweep_lost(later).len(), 1);
        assert_eq!(*recorder.lost.lock().unwrap(), vec![guid()]);

        let outcome = associations
            .on_assoc_check(NetAddress(1), &check(70), later, |_| 0)
            .unwrap();
        assert_eq!(status(&outcome), AssocStatus::NotAssociated);
        assert_eq!(associations.device(&guid()).unwrap().last_battery_level, 70);
    }

    #[test]
    fn check_from_unknown_device_is_ignored() {
        let (_, associations) = setup(Vec::new());
        assert!(associations
            .on_assoc_check(NetAddress(1), &check(1), Instant::now(), |_| 0)
            .is_none());
    }

    #[test]
    fn contact_keeps_device_alive() {
        let (recorder, associations) = setup(Vec::new());
        let now = Instant::now();
        associations.on_assoc_req(NetAddress::GATEWAY, &req(), now).unwrap();
        associations.activate_settled(now + Duration::from_secs(1));

        associations.touch(NetAddress(1), now + Duration::from_secs(200));
        assert!(associations
            .sweep_lost(now + Duration::from_secs(400))
            .is_empty());
        assert!(recorder.lost.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_ack_ids_are_flagged() {
        let (_, associations) = setup(Vec::new());
        associations.add_device(NetworkDevice::with_address(guid(), NetAddress(3)));

        assert_eq!(associations.accept_ack_id(NetAddress(3), 7), Some(true));
        assert_eq!(associations.accept_ack_id(NetAddress(3), 7), Some(false));
        assert_eq!(associations.accept_ack_id(NetAddress(3), 8), Some(true));
        assert_eq!(associations.accept_ack_id(NetAddress(4), 8), None);
    }

    #[test]
    fn terminate_all_ends_every_device() {
        let (recorder, associations) = setup(Vec::new());
        associations.add_device(NetworkDevice::with_address(guid(), NetAddress(3)));
        associations.add_device(NetworkDevice::new(NetGuid(*b"DEVICE02")));

        associations.terminate_all();
        assert!(associations
            .devices()
            .iter()
            .all(|device| device.state == NetworkDeviceState::Terminated));

        let states: Vec<NetworkDeviceState> = recorder
            .changed
            .lock()
            .unwrap()
            .iter()
            .map(|(device, _)| device.state)
            .collect();
        assert_eq!(
            states,
            vec![
                NetworkDeviceState::Stopped,
                NetworkDeviceState::Stopped,
                NetworkDeviceState::Terminated,
                NetworkDeviceState::Terminated,
            ]
        );
    }
}
