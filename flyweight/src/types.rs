use std::fmt::{self, Debug, Display};
use std::io::{Read, Write};
use std::str::FromStr;

use serde::Deserialize;

use crate::{Error, ErrorKind, ReadWire, ReadWireExt, Result, WriteWire, WriteWireExt};

pub type AckId = u8;
pub type Channel = u8;

pub const EMPTY_ACK_ID: AckId = 0;
pub const MAX_CHANNELS: Channel = 16;
pub const NO_PREFERRED_CHANNEL: Channel = 255;

/// Strip an optional `0x` prefix and decode exactly `N` bytes of hex.
fn parse_hex<const N: usize>(s: &str) -> Result<[u8; N]> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let invalid = || Error::from(ErrorKind::InvalidValue(s.to_string()));

    if digits.len() != N * 2 || !digits.is_ascii() {
        return Err(invalid());
    }

    let mut bytes = [0; N];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
    }
    Ok(bytes)
}

/// The 4-bit network number that partitions controllers sharing a channel.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Deserialize)]
#[serde(try_from = "u8")]
pub struct NetworkId(u8);

impl NetworkId {
    pub const ZERO: NetworkId = NetworkId(0x0);
    pub const DEFAULT: NetworkId = NetworkId(0x1);
    pub const BROADCAST: NetworkId = NetworkId(0xF);

    pub fn new(value: u8) -> Result<Self> {
        if value > 0xF {
            return Err(ErrorKind::InvalidValue(format!("network id {}", value)).into());
        }
        Ok(NetworkId(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == NetworkId::BROADCAST
    }
}

impl Default for NetworkId {
    fn default() -> Self {
        NetworkId::DEFAULT
    }
}

impl std::convert::TryFrom<u8> for NetworkId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        NetworkId::new(value)
    }
}

impl Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let [value] = parse_hex::<1>(s)?;
        NetworkId::new(value)
    }
}

impl ReadWire for NetworkId {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        let byte: u8 = r.read_wire()?;
        Ok(NetworkId(byte & 0x0F))
    }
}

impl WriteWire for NetworkId {
    fn wire_len(&self) -> u16 {
        1
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_wire(self.0)
    }
}

/// A device's short address on the network, assigned by the controller.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NetAddress(pub u8);

impl NetAddress {
    pub const GATEWAY: NetAddress = NetAddress(0x00);
    pub const BROADCAST: NetAddress = NetAddress(0xFF);

    pub fn is_broadcast(self) -> bool {
        self == NetAddress::BROADCAST
    }

    pub fn is_reserved(self) -> bool {
        self == NetAddress::GATEWAY || self == NetAddress::BROADCAST
    }
}

impl Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl FromStr for NetAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let [value] = parse_hex::<1>(s)?;
        Ok(NetAddress(value))
    }
}

impl ReadWire for NetAddress {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        Ok(NetAddress(r.read_wire()?))
    }
}

impl WriteWire for NetAddress {
    fn wire_len(&self) -> u16 {
        1
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_wire(self.0)
    }
}

/// The identifier burned into a device's firmware.
#[derive(Copy, Clone, Eq, Hash, PartialEq)]
pub struct NetGuid(pub [u8; NetGuid::LEN]);

impl NetGuid {
    pub const LEN: usize = 8;

    /// Sender id used by the controller's own channel checks.
    pub const PRIVATE: NetGuid = NetGuid(*b"00000000");

    pub fn bytes(&self) -> &[u8; NetGuid::LEN] {
        &self.0
    }
}

impl Debug for NetGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetGuid({})", self)
    }
}

impl Display for NetGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for NetGuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(NetGuid(parse_hex::<{ NetGuid::LEN }>(s)?))
    }
}

impl ReadWire for NetGuid {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        let mut bytes = [0; NetGuid::LEN];
        r.read_exact(&mut bytes)?;
        Ok(NetGuid(bytes))
    }
}

impl WriteWire for NetGuid {
    fn wire_len(&self) -> u16 {
        NetGuid::LEN as u16
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_all(&self.0)?;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AckState {
    None,
    Pending,
    Succeeded,
    NoResponse,
}

impl Default for AckState {
    fn default() -> Self {
        AckState::None
    }
}
