use std::fmt::{self, Display};

use crate::{FrameError, NetAddress};

#[derive(Debug)]
pub enum ErrorKind {
    Frame(FrameError),
    UnsupportedVersion(u8),
    UnsupportedCommand { group: u8, id: u8 },
    InvalidValue(String),
    ChannelOutOfRange(u8),
    AckQueueFull(NetAddress),
    NotStarted,
    QueryExpired(u32),
    Stopped,
    SerialPort(tokio_serial::Error),
    Io(std::io::Error),
    ChannelError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Frame(error) => write!(f, "frame error: {}", error),
            ErrorKind::UnsupportedVersion(version) => {
                write!(f, "unsupported protocol version: {}", version)
            }
            ErrorKind::UnsupportedCommand { group, id } => {
                write!(f, "unsupported command: group {} id {}", group, id)
            }
            ErrorKind::InvalidValue(value) => write!(f, "invalid value: {}", value),
            ErrorKind::ChannelOutOfRange(channel) => {
                write!(f, "radio channel out of range: {}", channel)
            }
            ErrorKind::AckQueueFull(address) => {
                write!(f, "ack queue full for destination {}", address)
            }
            ErrorKind::NotStarted => write!(f, "interface not started"),
            ErrorKind::QueryExpired(query_id) => {
                write!(f, "no response to query {:#010x}", query_id)
            }
            ErrorKind::Stopped => write!(f, "controller stopped"),
            ErrorKind::SerialPort(error) => write!(f, "serial port error: {}", error),
            ErrorKind::Io(error) => write!(f, "IO error: {}", error),
            ErrorKind::ChannelError => write!(f, "channel error"),
        }
    }
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flyweight error: {}", self.kind)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(other: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io(other),
        }
    }
}

impl From<tokio_serial::Error> for Error {
    fn from(other: tokio_serial::Error) -> Self {
        Error {
            kind: ErrorKind::SerialPort(other),
        }
    }
}

impl From<FrameError> for Error {
    fn from(other: FrameError) -> Self {
        Error {
            kind: ErrorKind::Frame(other),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
