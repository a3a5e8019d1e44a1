mod acks;
mod assoc;
mod channel;
mod config;
mod controller;
mod device;
mod errors;
mod protocol;
mod queue;
mod slip;
mod transport;
mod types;

#[macro_use]
extern crate log;

pub use crate::acks::{AckEngine, Acknowledged, Sweep};
pub use crate::assoc::{Associations, CheckOutcome, ReqOutcome};
pub use crate::channel::{ChannelInfo, ChannelSurvey};
pub use crate::config::ControllerConfig;
pub use crate::controller::Controller;
pub use crate::device::{
    ControllerListener, DeviceRegistry, DeviceTable, NetworkDevice, NetworkDeviceState,
};
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::protocol::{
    Ack, AssocAck, AssocCheck, AssocCommand, AssocReq, AssocResp, AssocStatus, CheckType,
    Command, CommandFamily, ControlCommand, InfoCommand, InfoMessage, NetCheck, NetMgmtCommand,
    Packet, Payload, SystemStatus, ACK_DATA_BYTES,
};
pub use crate::queue::SendBuffer;
pub use crate::slip::{FrameError, Reader as FrameReader, Writer as FrameWriter};
pub use crate::slip::{MAX_FRAME_BYTES, MAX_PACKET_BYTES};
pub use crate::transport::{
    BoxedRead, BoxedWrite, Connector, SerialConnector, SlipTransport, TcpClientConnector,
    TcpServerConnector, Transport, DEFAULT_BAUD, DEFAULT_TCP_PORT,
};
pub use crate::types::{
    AckId, AckState, Channel, NetAddress, NetGuid, NetworkId, EMPTY_ACK_ID, MAX_CHANNELS,
    NO_PREFERRED_CHANNEL,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub trait ReadWire: Sized {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read;
}

pub trait WriteWire {
    fn wire_len(&self) -> u16;

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write;
}

impl ReadWire for u8 {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        Ok(r.read_u8()?)
    }
}

impl WriteWire for u8 {
    fn wire_len(&self) -> u16 {
        1
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_u8(self)?;
        Ok(())
    }
}

impl ReadWire for u32 {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        Ok(r.read_u32::<LittleEndian>()?)
    }
}

impl WriteWire for u32 {
    fn wire_len(&self) -> u16 {
        4
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_u32::<LittleEndian>(self)?;
        Ok(())
    }
}

impl ReadWire for [u8; 4] {
    fn read_wire<R>(r: &mut R) -> Result<Self>
    where
        R: Read,
    {
        let mut bytes = [0; 4];
        r.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

impl WriteWire for [u8; 4] {
    fn wire_len(&self) -> u16 {
        4
    }

    fn write_wire<W>(self, w: &mut W) -> Result<()>
    where
        W: Write,
    {
        w.write_all(&self)?;
        Ok(())
    }
}

pub trait ReadWireExt {
    fn read_wire<T>(&mut self) -> Result<T>
    where
        T: ReadWire;

    /// Reads everything left in the stream.
    fn read_rest(&mut self) -> Result<Vec<u8>>;
}

impl<R> ReadWireExt for R
where
    R: Read,
{
    fn read_wire<T>(&mut self) -> Result<T>
    where
        T: ReadWire,
    {
        T::read_wire(self)
    }

    fn read_rest(&mut self) -> Result<Vec<u8>> {
        let mut rest = Vec::new();
        self.read_to_end(&mut rest)?;
        Ok(rest)
    }
}

pub trait WriteWireExt {
    fn write_wire<T>(&mut self, value: T) -> Result<()>
    where
        T: WriteWire;
}

impl<W> WriteWireExt for W
where
    W: Write,
{
    fn write_wire<T>(&mut self, value: T) -> Result<()>
    where
        T: WriteWire,
    {
        value.write_wire(self)
    }
}
