use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use crate::slip::{Reader, Writer};
use crate::{ErrorKind, NetworkId, Packet, Result};

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub const DEFAULT_BAUD: u32 = 1_250_000;
pub const DEFAULT_TCP_PORT: u16 = 45000;

/// Packet-level link to the gateway radio.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    /// Stops the link, waits for it to settle, and starts it again.
    async fn reset(&self) -> Result<()>;

    fn is_started(&self) -> bool;

    async fn send_packet(&self, packet: &Packet) -> Result<()>;

    /// Reads the next packet meant for `network_id`.
    ///
    /// Returns `None` when the transport stops, or when a frame was dropped because it could
    /// not be decoded or belongs to another network.
    async fn receive_packet(&self, network_id: NetworkId) -> Result<Option<Packet>>;
}

/// Opens the byte streams a `SlipTransport` frames packets over.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(BoxedRead, BoxedWrite)>;

    fn describe(&self) -> String;
}

/// Serial link to a radio dongle, 8N1.
pub struct SerialConnector {
    path: String,
    baud: u32,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self) -> Result<(BoxedRead, BoxedWrite)> {
        let mut port = tokio_serial::new(self.path.as_str(), self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;

        // The dongle only talks once both handshake lines are up.
        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(true)?;

        let (read, write) = tokio::io::split(port);
        Ok((Box::new(read), Box::new(write)))
    }

    fn describe(&self) -> String {
        format!("serial {} at {} baud", self.path, self.baud)
    }
}

/// Connects out to a radio simulator.
pub struct TcpClientConnector {
    addr: String,
}

impl TcpClientConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpClientConnector {
    async fn connect(&self) -> Result<(BoxedRead, BoxedWrite)> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok((Box::new(read), Box::new(write)))
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.addr)
    }
}

/// Waits for a radio to connect in. Each `connect` accepts one peer.
pub struct TcpServerConnector {
    listener: TcpListener,
}

impl TcpServerConnector {
    pub async fn bind(addr: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr.into().as_str()).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Connector for TcpServerConnector {
    async fn connect(&self) -> Result<(BoxedRead, BoxedWrite)> {
        let (stream, peer) = self.listener.accept().await?;
        info!("radio connected from {}", peer);
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok((Box::new(read), Box::new(write)))
    }

    fn describe(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp listener {}", addr),
            Err(_) => "tcp listener".to_string(),
        }
    }
}

/// A `Transport` that frames packets with SLIP over whatever streams its `Connector` opens.
pub struct SlipTransport<C> {
    connector: C,
    reader: Mutex<Option<Reader<BoxedRead>>>,
    writer: Mutex<Option<Writer<BoxedWrite>>>,
    started: watch::Sender<bool>,
    resetting: Mutex<()>,
    cooldown: Duration,
}

impl<C> SlipTransport<C>
where
    C: Connector,
{
    pub fn new(connector: C, cooldown: Duration) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            connector,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            started,
            resetting: Mutex::new(()),
            cooldown,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }
}

/// Resolves once the watched flag is false, or its sender is gone.
pub(crate) async fn until_stopped(started: &mut watch::Receiver<bool>) {
    loop {
        if !*started.borrow_and_update() {
            return;
        }
        if started.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl<C> Transport for SlipTransport<C>
where
    C: Connector,
{
    async fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }

        let (read, write) = self.connector.connect().await?;
        let mut writer = Writer::new(write);
        writer.write_sync().await?;

        *self.reader.lock().await = Some(Reader::new(read));
        *self.writer.lock().await = Some(writer);
        self.started.send_replace(true);
        info!("started {}", self.connector.describe());
        Ok(())
    }

    async fn stop(&self) {
        if !self.started.send_replace(false) {
            return;
        }

        // Readers see the flag drop and release the reader lock.
        self.reader.lock().await.take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(error) = writer.shutdown().await {
                debug!("error closing {}: {}", self.connector.describe(), error);
            }
        }
        info!("stopped {}", self.connector.describe());
    }

    async fn reset(&self) -> Result<()> {
        let _guard = match self.resetting.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Someone else is already resetting: wait for them and share their outcome.
                let _ = self.resetting.lock().await;
                return if self.is_started() {
                    Ok(())
                } else {
                    Err(ErrorKind::NotStarted.into())
                };
            }
        };

        warn!("resetting {}", self.connector.describe());
        self.stop().await;
        tokio::time::sleep(self.cooldown).await;
        self.start().await
    }

    fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let frame = packet.to_frame()?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ErrorKind::NotStarted)?;
        debug!("sending {}", packet);
        writer.write_frame(&frame).await
    }

    async fn receive_packet(&self, network_id: NetworkId) -> Result<Option<Packet>> {
        let mut started = self.started.subscribe();
        if !*started.borrow_and_update() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        let reader = match reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        let frame = tokio::select! {
            frame = reader.read_frame() => frame,
            _ = until_stopped(&mut started) => return Ok(None),
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                if let ErrorKind::Frame(frame_error) = &error.kind {
                    warn!("dropping frame: {}", frame_error);
                    return Ok(None);
                }
                return Err(error);
            }
        };

        let packet = match Packet::from_frame(&frame) {
            Ok(packet) => packet,
            Err(error) => {
                warn!("dropping undecodable frame {:02x?}: {}", frame, error);
                return Ok(None);
            }
        };

        if packet.network_id != network_id
            && packet.network_id != NetworkId::ZERO
            && packet.network_id != NetworkId::BROADCAST
        {
            debug!("dropping packet for network {}: {}", packet.network_id, packet);
            return Ok(None);
        }

        debug!("received {}", packet);
        Ok(Some(packet))
    }
}
