use std::convert::TryFrom;
use std::fmt::{self, Display};
use std::io::{Cursor, Read, Write};

use tokio::time::Instant;

use crate::{
    AckId, AckState, Channel, Error, ErrorKind, NetAddress, NetGuid, NetworkId, ReadWire,
    ReadWireExt, Result, WriteWire, WriteWireExt, EMPTY_ACK_ID,
};

pub const ACK_DATA_BYTES: usize = 8;

const PROTOCOL_VERSION: u8 = 0;
const PACKET_TYPE_STANDARD: u8 = 0;
const PACKET_TYPE_ACK: u8 = 1;
const HEADER_LEN: usize = 4;
const COMMAND_HEADER_LEN: usize = 2;

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum CommandFamily {
    NetMgmt,
    Assoc,
    Info,
    Control,
}

impl From<CommandFamily> for u8 {
    fn from(family: CommandFamily) -> u8 {
        match family {
            CommandFamily::NetMgmt => 0,
            CommandFamily::Assoc => 1,
            CommandFamily::Info => 2,
            CommandFamily::Control => 3,
        }
    }
}

impl Display for CommandFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandFamily::NetMgmt => write!(f, "NetMgmt ({})", u8::from(*self)),
            CommandFamily::Assoc => write!(f, "Assoc ({})", u8::from(*self)),
            CommandFamily::Info => write!(f, "Info ({})", u8::from(*self)),
            CommandFamily::Control => write!(f, "Control ({})", u8::from(*self)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CheckType {
    Request,
    Response,
}

impl ReadWire for CheckType {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        match u8::read_wire(r)? {
            1 => Ok(CheckType::Request),
            2 => Ok(CheckType::Response),
            other => Err(ErrorKind::InvalidValue(format!("check type {}", other)).into()),
        }
    }
}

impl WriteWire for CheckType {
    fn wire_len(&self) -> u16 {
        1
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        let byte: u8 = match self {
            CheckType::Request => 1,
            CheckType::Response => 2,
        };
        w.write_wire(byte)
    }
}

/// A channel check, either broadcast by a controller or answered by a radio.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NetCheck {
    pub check_type: CheckType,
    pub network_id: NetworkId,
    pub guid: NetGuid,
    pub channel: Channel,
    pub energy: u8,
    pub link_quality: u8,
}

impl ReadWire for NetCheck {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        Ok(NetCheck {
            check_type: r.read_wire()?,
            network_id: r.read_wire()?,
            guid: r.read_wire()?,
            channel: r.read_wire()?,
            energy: r.read_wire()?,
            link_quality: r.read_wire()?,
        })
    }
}

impl WriteWire for NetCheck {
    fn wire_len(&self) -> u16 {
        13
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_wire(self.check_type)?;
        w.write_wire(self.network_id)?;
        w.write_wire(self.guid)?;
        w.write_wire(self.channel)?;
        w.write_wire(self.energy)?;
        w.write_wire(self.link_quality)?;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NetMgmtCommand {
    Setup {
        network_id: NetworkId,
        channel: Channel,
    },
    Check(NetCheck),
    IntfTest {
        number: u8,
    },
}

impl NetMgmtCommand {
    fn id(&self) -> u8 {
        match self {
            NetMgmtCommand::Setup { .. } => 1,
            NetMgmtCommand::Check(_) => 2,
            NetMgmtCommand::IntfTest { .. } => 3,
        }
    }
}

/// Diagnostic flags a device reports when it asks to associate.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SystemStatus(pub u8);

impl SystemStatus {
    pub const LVD: u8 = 0x02;
    pub const ICG: u8 = 0x04;
    pub const ILOP: u8 = 0x10;
    pub const COP: u8 = 0x20;
    pub const PIN: u8 = 0x40;
    pub const POR: u8 = 0x80;

    /// Names of the reset causes that are set.
    pub fn flags(self) -> Vec<&'static str> {
        [
            (SystemStatus::LVD, "LVD"),
            (SystemStatus::ICG, "ICG"),
            (SystemStatus::ILOP, "ILOP"),
            (SystemStatus::COP, "COP"),
            (SystemStatus::PIN, "PIN"),
            (SystemStatus::POR, "POR"),
        ]
        .iter()
        .filter(|(bit, _)| self.0 & bit > 0)
        .map(|(_, name)| *name)
        .collect()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AssocReq {
    pub guid: NetGuid,
    pub hardware_version: [u8; 4],
    pub firmware_version: [u8; 4],
    pub radio_protocol_version: u8,
    pub system_status: SystemStatus,
}

impl ReadWire for AssocReq {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        Ok(AssocReq {
            guid: r.read_wire()?,
            hardware_version: r.read_wire()?,
            firmware_version: r.read_wire()?,
            radio_protocol_version: r.read_wire()?,
            system_status: SystemStatus(r.read_wire()?),
        })
    }
}

impl WriteWire for AssocReq {
    fn wire_len(&self) -> u16 {
        18
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_wire(self.guid)?;
        w.write_wire(self.hardware_version)?;
        w.write_wire(self.firmware_version)?;
        w.write_wire(self.radio_protocol_version)?;
        w.write_wire(self.system_status.0)?;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AssocResp {
    pub guid: NetGuid,
    pub address: NetAddress,
    pub network_id: NetworkId,
    pub sleep_seconds: u8,
}

impl ReadWire for AssocResp {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        Ok(AssocResp {
            guid: r.read_wire()?,
            address: r.read_wire()?,
            network_id: r.read_wire()?,
            sleep_seconds: r.read_wire()?,
        })
    }
}

impl WriteWire for AssocResp {
    fn wire_len(&self) -> u16 {
        11
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_wire(self.guid)?;
        w.write_wire(self.address)?;
        w.write_wire(self.network_id)?;
        w.write_wire(self.sleep_seconds)?;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AssocCheck {
    pub guid: NetGuid,
    pub battery_level: u8,
}

impl ReadWire for AssocCheck {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        Ok(AssocCheck {
            guid: r.read_wire()?,
            battery_level: r.read_wire()?,
        })
    }
}

impl WriteWire for AssocCheck {
    fn wire_len(&self) -> u16 {
        9
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_wire(self.guid)?;
        w.write_wire(self.battery_level)?;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AssocStatus {
    Associated,
    NotAssociated,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AssocAck {
    pub guid: NetGuid,
    pub status: AssocStatus,
}

impl ReadWire for AssocAck {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        let guid = r.read_wire()?;
        let status = match u8::read_wire(r)? {
            0 => AssocStatus::Associated,
            1 => AssocStatus::NotAssociated,
            other => {
                return Err(ErrorKind::InvalidValue(format!("assoc status {}", other)).into())
            }
        };
        Ok(AssocAck { guid, status })
    }
}

impl WriteWire for AssocAck {
    fn wire_len(&self) -> u16 {
        9
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_wire(self.guid)?;
        let status: u8 = match self.status {
            AssocStatus::Associated => 0,
            AssocStatus::NotAssociated => 1,
        };
        w.write_wire(status)?;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AssocCommand {
    Req(AssocReq),
    Resp(AssocResp),
    Check(AssocCheck),
    Ack(AssocAck),
}

impl AssocCommand {
    fn id(&self) -> u8 {
        match self {
            AssocCommand::Req(_) => 1,
            AssocCommand::Resp(_) => 2,
            AssocCommand::Check(_) => 3,
            AssocCommand::Ack(_) => 4,
        }
    }
}

/// A request or response on the query path, correlated by `query_id`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InfoMessage {
    pub query_id: u32,
    pub kind: u8,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InfoCommand {
    Query(InfoMessage),
    Response(InfoMessage),
}

impl InfoCommand {
    fn id(&self) -> u8 {
        match self {
            InfoCommand::Query(_) => 1,
            InfoCommand::Response(_) => 2,
        }
    }

    pub fn message(&self) -> &InfoMessage {
        match self {
            InfoCommand::Query(message) | InfoCommand::Response(message) => message,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlCommand {
    Scan(String),
    ButtonPress { button: u8, value: u8 },
    Other { id: u8, body: Vec<u8> },
}

impl ControlCommand {
    fn id(&self) -> u8 {
        match self {
            ControlCommand::Scan(_) => 1,
            ControlCommand::ButtonPress { .. } => 2,
            ControlCommand::Other { id, .. } => *id,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    NetMgmt(NetMgmtCommand),
    Assoc(AssocCommand),
    Info(InfoCommand),
    Control(ControlCommand),
}

impl Command {
    pub fn family(&self) -> CommandFamily {
        match self {
            Command::NetMgmt(_) => CommandFamily::NetMgmt,
            Command::Assoc(_) => CommandFamily::Assoc,
            Command::Info(_) => CommandFamily::Info,
            Command::Control(_) => CommandFamily::Control,
        }
    }

    fn id(&self) -> u8 {
        match self {
            Command::NetMgmt(command) => command.id(),
            Command::Assoc(command) => command.id(),
            Command::Info(command) => command.id(),
            Command::Control(command) => command.id(),
        }
    }

    fn write_payload(&self, buffer: &mut Vec<u8>) -> Result<()> {
        match self {
            Command::NetMgmt(NetMgmtCommand::Setup {
                network_id,
                channel,
            }) => {
                buffer.write_wire(*network_id)?;
                buffer.write_wire(*channel)?;
            }
            Command::NetMgmt(NetMgmtCommand::Check(check)) => buffer.write_wire(*check)?,
            Command::NetMgmt(NetMgmtCommand::IntfTest { number }) => buffer.write_wire(*number)?,
            Command::Assoc(AssocCommand::Req(req)) => buffer.write_wire(*req)?,
            Command::Assoc(AssocCommand::Resp(resp)) => buffer.write_wire(*resp)?,
            Command::Assoc(AssocCommand::Check(check)) => buffer.write_wire(*check)?,
            Command::Assoc(AssocCommand::Ack(ack)) => buffer.write_wire(*ack)?,
            Command::Info(info) => {
                let message = info.message();
                buffer.write_wire(message.query_id)?;
                buffer.write_wire(message.kind)?;
                buffer.extend_from_slice(&message.body);
            }
            Command::Control(ControlCommand::Scan(text)) => {
                buffer.extend_from_slice(text.as_bytes())
            }
            Command::Control(ControlCommand::ButtonPress { button, value }) => {
                buffer.write_wire(*button)?;
                buffer.write_wire(*value)?;
            }
            Command::Control(ControlCommand::Other { id, body }) => {
                if *id == 1 || *id == 2 {
                    let reserved = format!("control command id {} is reserved", id);
                    return Err(ErrorKind::InvalidValue(reserved).into());
                }
                buffer.extend_from_slice(body)
            }
        }

        Ok(())
    }

    pub fn write_to(&self, buffer: &mut Vec<u8>) -> Result<()> {
        // The endpoint nibble is always zero: every device has a single endpoint.
        buffer.write_wire(u8::from(self.family()) << 4)?;
        buffer.write_wire(self.id())?;
        self.write_payload(buffer)
    }

    pub fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        let header: u8 = r.read_wire()?;
        let group = header >> 4;
        let id: u8 = r.read_wire()?;
        let unsupported = || Error::from(ErrorKind::UnsupportedCommand { group, id });

        let command = match (group, id) {
            (0, 1) => Command::NetMgmt(NetMgmtCommand::Setup {
                network_id: r.read_wire()?,
                channel: r.read_wire()?,
            }),
            (0, 2) => Command::NetMgmt(NetMgmtCommand::Check(r.read_wire()?)),
            (0, 3) => Command::NetMgmt(NetMgmtCommand::IntfTest {
                number: r.read_wire()?,
            }),
            (1, 1) => Command::Assoc(AssocCommand::Req(r.read_wire()?)),
            (1, 2) => Command::Assoc(AssocCommand::Resp(r.read_wire()?)),
            (1, 3) => Command::Assoc(AssocCommand::Check(r.read_wire()?)),
            (1, 4) => Command::Assoc(AssocCommand::Ack(r.read_wire()?)),
            (2, 1) | (2, 2) => {
                let message = InfoMessage {
                    query_id: r.read_wire()?,
                    kind: r.read_wire()?,
                    body: r.read_rest()?,
                };
                if id == 1 {
                    Command::Info(InfoCommand::Query(message))
                } else {
                    Command::Info(InfoCommand::Response(message))
                }
            }
            (3, 1) => {
                let text = String::from_utf8(r.read_rest()?)
                    .map_err(|_| ErrorKind::InvalidValue("scan text is not UTF-8".to_string()))?;
                Command::Control(ControlCommand::Scan(text))
            }
            (3, 2) => Command::Control(ControlCommand::ButtonPress {
                button: r.read_wire()?,
                value: r.read_wire()?,
            }),
            (3, id) => Command::Control(ControlCommand::Other {
                id,
                body: r.read_rest()?,
            }),
            _ => return Err(unsupported()),
        };

        Ok(command)
    }
}

/// Body of an acknowledgement sent by a device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ack {
    pub header: u8,
    pub data: [u8; ACK_DATA_BYTES],
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Command(Command),
    Ack(Ack),
}

/// One message on the air, plus the bookkeeping used to deliver it.
///
/// Only the network id, addresses, ack id and payload go on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub network_id: NetworkId,
    pub src: NetAddress,
    pub dst: NetAddress,
    pub ack_id: AckId,
    pub ack_state: AckState,
    pub ack_data: Option<[u8; ACK_DATA_BYTES]>,
    pub sent_at: Option<Instant>,
    pub send_count: u8,
    pub scheduled_at: Option<Instant>,
    pub payload: Payload,
}

impl Packet {
    pub fn new(network_id: NetworkId, src: NetAddress, dst: NetAddress, command: Command) -> Self {
        Self::with_payload(network_id, src, dst, Payload::Command(command))
    }

    pub fn new_ack(
        network_id: NetworkId,
        src: NetAddress,
        dst: NetAddress,
        ack_id: AckId,
        data: [u8; ACK_DATA_BYTES],
    ) -> Self {
        let ack = Ack { header: 0, data };
        let mut packet = Self::with_payload(network_id, src, dst, Payload::Ack(ack));
        packet.ack_id = ack_id;
        packet
    }

    fn with_payload(
        network_id: NetworkId,
        src: NetAddress,
        dst: NetAddress,
        payload: Payload,
    ) -> Self {
        Self {
            network_id,
            src,
            dst,
            ack_id: EMPTY_ACK_ID,
            ack_state: AckState::None,
            ack_data: None,
            sent_at: None,
            send_count: 0,
            scheduled_at: None,
            payload,
        }
    }

    pub fn command(&self) -> Option<&Command> {
        match &self.payload {
            Payload::Command(command) => Some(command),
            Payload::Ack(_) => None,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.payload, Payload::Ack(_))
    }

    /// Whether the packet can never be acknowledged.
    pub fn is_broadcast(&self) -> bool {
        self.network_id.is_broadcast() || self.dst.is_broadcast()
    }

    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let packet_type = if self.is_ack() {
            PACKET_TYPE_ACK
        } else {
            PACKET_TYPE_STANDARD
        };

        let mut buffer = Vec::with_capacity(HEADER_LEN + COMMAND_HEADER_LEN + ACK_DATA_BYTES);
        buffer.write_wire(PROTOCOL_VERSION << 6 | packet_type << 5 | self.network_id.value())?;
        buffer.write_wire(self.src)?;
        buffer.write_wire(self.dst)?;
        buffer.write_wire(self.ack_id)?;

        match &self.payload {
            Payload::Command(command) => command.write_to(&mut buffer)?,
            Payload::Ack(ack) => {
                buffer.write_wire(ack.header)?;
                buffer.extend_from_slice(&ack.data);
            }
        }

        Ok(buffer)
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let mut frame = Cursor::new(frame);

        let first: u8 = frame.read_wire()?;
        let version = first >> 6;
        if version != PROTOCOL_VERSION {
            return Err(ErrorKind::UnsupportedVersion(version).into());
        }
        let packet_type = (first >> 5) & 0b1;
        let network_id = NetworkId::try_from(first & 0x0F)?;
        let src = frame.read_wire()?;
        let dst = frame.read_wire()?;
        let ack_id = frame.read_wire()?;

        let payload = if packet_type == PACKET_TYPE_ACK {
            let header = frame.read_wire()?;
            let mut data = [0; ACK_DATA_BYTES];
            frame.read_exact(&mut data)?;
            Payload::Ack(Ack { header, data })
        } else {
            Payload::Command(Command::read_from(&mut frame)?)
        };

        let mut packet = Self::with_payload(network_id, src, dst, payload);
        packet.ack_id = ack_id;
        Ok(packet)
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "net={} src={} dst={} ack={} ",
            self.network_id, self.src, self.dst, self.ack_id
        )?;
        match &self.payload {
            Payload::Command(command) => write!(f, "{:?}", command),
            Payload::Ack(ack) => write!(f, "Ack({:02x?})", ack.data),
        }
    }
}
