use std::collections::HashMap;
use std::fmt::{self, Display};

use tokio::time::Instant;

use crate::{AckId, ControlCommand, NetAddress, NetGuid, EMPTY_ACK_ID};

/// Declared in lifecycle order, so states compare by how far a device has got.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum NetworkDeviceState {
    Invalid,
    WakeRcvd,
    AssignSent,
    AssignAckRcvd,
    Setup,
    Started,
    Lost,
    Stopped,
    Terminated,
}

impl Default for NetworkDeviceState {
    fn default() -> Self {
        NetworkDeviceState::Invalid
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkDevice {
    pub guid: NetGuid,
    pub address: Option<NetAddress>,
    pub state: NetworkDeviceState,
    pub last_contact: Option<Instant>,
    pub last_battery_level: u8,
    pub hardware_version: [u8; 4],
    pub firmware_version: [u8; 4],
    pub sleep_seconds: u8,
    /// Ack id of the last acknowledged packet this device sent us.
    pub last_incoming_ack_id: AckId,
}

impl NetworkDevice {
    pub fn new(guid: NetGuid) -> Self {
        Self {
            guid,
            address: None,
            state: NetworkDeviceState::Invalid,
            last_contact: None,
            last_battery_level: 0,
            hardware_version: [0; 4],
            firmware_version: [0; 4],
            sleep_seconds: 0,
            last_incoming_ack_id: EMPTY_ACK_ID,
        }
    }

    pub fn with_address(guid: NetGuid, address: NetAddress) -> Self {
        Self {
            address: Some(address),
            ..Self::new(guid)
        }
    }

    /// Whether `ack_id` is not a repeat of the last packet we acknowledged.
    pub fn is_ack_id_new(&self, ack_id: AckId) -> bool {
        ack_id != self.last_incoming_ack_id
    }

    /// Whether the device needs the controller to hand it an address.
    pub fn needs_address(&self) -> bool {
        match self.address {
            None => true,
            Some(address) => address == NetAddress::GATEWAY,
        }
    }
}

impl Display for NetworkDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{}@{} ({:?})", self.guid, address, self.state),
            None => write!(f, "{}@- ({:?})", self.guid, self.state),
        }
    }
}

/// Persistent store of the devices this controller manages.
pub trait DeviceRegistry: Send + Sync {
    fn find_device_by_guid(&self, guid: &NetGuid) -> Option<NetworkDevice>;

    fn find_device_by_address(&self, address: NetAddress) -> Option<NetworkDevice>;

    fn on_device_changed(&self, device: &NetworkDevice, persistent_fields_changed: bool);
}

/// Application hooks for the device lifecycle.
pub trait ControllerListener: Send + Sync {
    fn can_device_associate(&self, guid: &NetGuid) -> bool;

    fn on_device_lost(&self, device: &NetworkDevice);

    fn on_device_became_active(&self, device: &NetworkDevice);

    fn on_control_command(
        &self,
        _source: NetAddress,
        _device: Option<&NetworkDevice>,
        _command: &ControlCommand,
    ) {
    }
}

/// The controller's lookup of devices by guid and by address.
#[derive(Debug, Default)]
pub struct DeviceTable {
    by_guid: HashMap<NetGuid, NetworkDevice>,
    by_address: HashMap<NetAddress, NetGuid>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_guid.is_empty()
    }

    pub fn insert(&mut self, device: NetworkDevice) -> Option<NetworkDevice> {
        let previous = self.remove(&device.guid);
        if let Some(address) = device.address {
            if !address.is_reserved() {
                // An address belongs to at most one device.
                if let Some(other) = self.by_address.insert(address, device.guid) {
                    if let Some(stale) = self.by_guid.get_mut(&other) {
                        stale.address = None;
                    }
                }
            }
        }
        self.by_guid.insert(device.guid, device);
        previous
    }

    pub fn remove(&mut self, guid: &NetGuid) -> Option<NetworkDevice> {
        let device = self.by_guid.remove(guid)?;
        if let Some(address) = device.address {
            if self.by_address.get(&address) == Some(guid) {
                self.by_address.remove(&address);
            }
        }
        Some(device)
    }

    pub fn get(&self, guid: &NetGuid) -> Option<&NetworkDevice> {
        self.by_guid.get(guid)
    }

    pub fn get_mut(&mut self, guid: &NetGuid) -> Option<&mut NetworkDevice> {
        self.by_guid.get_mut(guid)
    }

    pub fn by_address(&self, address: NetAddress) -> Option<&NetworkDevice> {
        self.by_address
            .get(&address)
            .and_then(|guid| self.by_guid.get(guid))
    }

    pub fn by_address_mut(&mut self, address: NetAddress) -> Option<&mut NetworkDevice> {
        let guid = *self.by_address.get(&address)?;
        self.by_guid.get_mut(&guid)
    }

    pub fn devices(&self) -> impl Iterator<Item = &NetworkDevice> {
        self.by_guid.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut NetworkDevice> {
        self.by_guid.values_mut()
    }

    /// First address in `1..=254` not held by any device.
    pub fn free_address(&self) -> Option<NetAddress> {
        (1..NetAddress::BROADCAST.0)
            .map(NetAddress)
            .find(|address| !self.by_address.contains_key(address))
    }

    /// Gives `guid` an address, keeping its current one if it already has a usable one.
    pub fn assign_address(&mut self, guid: &NetGuid) -> Option<NetAddress> {
        let current = self.by_guid.get(guid)?;
        if !current.needs_address() {
            return current.address;
        }

        let address = self.free_address()?;
        self.by_address.insert(address, *guid);
        if let Some(device) = self.by_guid.get_mut(guid) {
            device.address = Some(address);
        }
        Some(address)
    }
}
