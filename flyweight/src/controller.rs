use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flyweight_helpers::{Correlator, NonZeroId};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::acks::Acknowledged;
use crate::transport::until_stopped;
use crate::{
    AckEngine, AckId, AssocCommand, Associations, Channel, ChannelSurvey, CheckType, Command,
    ControllerConfig, ControllerListener, DeviceRegistry, Error, ErrorKind, InfoCommand,
    InfoMessage, NetAddress, NetCheck, NetGuid, NetMgmtCommand, NetworkDevice,
    NetworkDeviceState, NetworkId, Packet, Payload, Result, SendBuffer, Transport,
    ACK_DATA_BYTES, EMPTY_ACK_ID, MAX_CHANNELS, NO_PREFERRED_CHANNEL,
};

/// Below this much time to go, the sender stops sleeping and yields until the deadline.
const SPIN_WINDOW: Duration = Duration::from_millis(2);

type Queries = Correlator<u32, (NetAddress, Command), InfoMessage, Error>;

#[derive(Default)]
struct Radio {
    channel: Option<Channel>,
    selected: bool,
}

/// A transport, and the signal asking its receiver to reset it.
struct Link {
    transport: Arc<dyn Transport>,
    reset: Notify,
}

/// State shared by the controller handle and its workers.
struct Shared {
    config: ControllerConfig,
    links: Vec<Link>,
    running: AtomicBool,
    running_watch: watch::Sender<bool>,
    buffer: SendBuffer,
    acks: Mutex<AckEngine>,
    queries: Queries,
    query_ids: AtomicU32,
    associations: Associations,
    radio: Mutex<Radio>,
    survey: Mutex<Option<mpsc::UnboundedSender<NetCheck>>>,
    intf_check_pending: AtomicBool,
    intf_tests: NonZeroId,
}

/// Runs a device network: owns the workers that move packets between the transports and the
/// devices, and the state they share.
pub struct Controller {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        transports: Vec<Arc<dyn Transport>>,
        registry: Arc<dyn DeviceRegistry>,
        listener: Arc<dyn ControllerListener>,
    ) -> Self {
        let links = transports
            .into_iter()
            .map(|transport| Link {
                transport,
                reset: Notify::new(),
            })
            .collect();
        let (running_watch, _) = watch::channel(false);

        let shared = Shared {
            links,
            running: AtomicBool::new(false),
            running_watch,
            buffer: SendBuffer::new(config.send_buffer_capacity),
            acks: Mutex::new(AckEngine::new(config.ack_policy(), config.ack_queue_capacity)),
            queries: Correlator::new(config.query_policy()),
            query_ids: AtomicU32::new(1),
            associations: Associations::new(&config, registry, listener),
            radio: Mutex::new(Radio::default()),
            survey: Mutex::new(None),
            intf_check_pending: AtomicBool::new(false),
            intf_tests: NonZeroId::new(),
            config,
        };

        Self {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the transports and workers, then settles the radio channel.
    ///
    /// Without a preferred channel this scans every channel first, which takes a few seconds.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        shared.running_watch.send_replace(true);
        info!("starting controller on network {}", shared.config.network_id);

        for link in &shared.links {
            if let Err(error) = link.transport.start().await {
                error!("failed to start transport: {}", error);
                link.reset.notify_one();
            }
        }

        {
            let mut workers = self.workers();
            for index in 0..shared.links.len() {
                let rx = Rx {
                    shared: shared.clone(),
                    index,
                };
                workers.push(tokio::spawn(rx.task()));
            }
            let tx = Tx {
                shared: shared.clone(),
                scheduled: Vec::new(),
            };
            workers.push(tokio::spawn(tx.task()));
            let background = Background {
                shared: shared.clone(),
            };
            workers.push(tokio::spawn(background.task()));
        }

        let mut running = shared.running_watch.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(shared.config.start_delay()) => {}
            _ = until_stopped(&mut running) => return Err(ErrorKind::Stopped.into()),
        }

        let preferred = shared.config.preferred_channel;
        if preferred == NO_PREFERRED_CHANNEL {
            shared.select_channel().await?;
        } else {
            shared.set_radio_channel(preferred).await?;
        }
        Ok(())
    }

    /// Stops every worker and transport. Returns once all workers have finished.
    pub async fn stop(&self) {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping controller");
        shared.running_watch.send_replace(false);

        let workers: Vec<JoinHandle<()>> = self.workers().drain(..).collect();
        for worker in workers {
            if let Err(error) = worker.await {
                error!("worker failed: {}", error);
            }
        }

        for link in &shared.links {
            link.transport.stop().await;
        }

        shared.queries.expire_all(|_| ErrorKind::Stopped.into());
        shared.associations.terminate_all();
        info!("controller stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Queues `command` for `dst` on our network.
    ///
    /// With `ack_requested` the command is retried until the device acknowledges it, unless
    /// `dst` is the broadcast address.
    pub async fn send_command(
        &self,
        command: Command,
        dst: NetAddress,
        ack_requested: bool,
    ) -> Result<()> {
        let network_id = self.shared.config.network_id;
        self.shared
            .send(command, network_id, dst, ack_requested, None)
            .await
    }

    /// Like `send_command`, but the first transmission waits until `at`.
    pub async fn send_command_at(
        &self,
        command: Command,
        dst: NetAddress,
        ack_requested: bool,
        at: Instant,
    ) -> Result<()> {
        let network_id = self.shared.config.network_id;
        self.shared
            .send(command, network_id, dst, ack_requested, Some(at))
            .await
    }

    /// Sends an info query to `dst` and waits for the matching response.
    pub async fn query(&self, dst: NetAddress, kind: u8, body: Vec<u8>) -> Result<InfoMessage> {
        let shared = &self.shared;
        let query_id = shared.query_ids.fetch_add(1, Ordering::SeqCst);
        let command = Command::Info(InfoCommand::Query(InfoMessage {
            query_id,
            kind,
            body,
        }));
        debug!("query {:#010x} to {}", query_id, dst);

        let (sender, receiver) = oneshot::channel();
        let network_id = shared.config.network_id;
        let send = shared.send(command.clone(), network_id, dst, false, None);
        shared
            .queries
            .clone()
            .register_while(query_id, (dst, command), sender, send)
            .await;

        receiver.await.map_err(|_| ErrorKind::ChannelError)?
    }

    pub async fn set_radio_channel(&self, channel: Channel) -> Result<()> {
        self.shared.set_radio_channel(channel).await
    }

    /// Scans all channels and settles on the least busy one.
    pub async fn select_channel(&self) -> Result<Channel> {
        self.shared.select_channel().await
    }

    pub fn radio_channel(&self) -> Option<Channel> {
        self.shared.radio().channel
    }

    pub fn is_channel_selected(&self) -> bool {
        self.shared.radio().selected
    }

    pub fn network_id(&self) -> NetworkId {
        self.shared.config.network_id
    }

    pub fn add_network_device(&self, device: NetworkDevice) {
        self.shared.associations.add_device(device);
    }

    pub fn remove_network_device(&self, guid: &NetGuid) -> Option<NetworkDevice> {
        let device = self.shared.associations.remove_device(guid)?;
        if let Some(address) = device.address {
            self.shared.acks().clear(address);
        }
        Some(device)
    }

    pub fn device(&self, guid: &NetGuid) -> Option<NetworkDevice> {
        self.shared.associations.device(guid)
    }

    pub fn devices(&self) -> Vec<NetworkDevice> {
        self.shared.associations.devices()
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn acks(&self) -> MutexGuard<'_, AckEngine> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn radio(&self) -> MutexGuard<'_, Radio> {
        self.radio.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn survey(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<NetCheck>>> {
        self.survey.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> &Arc<dyn ControllerListener> {
        self.associations.listener()
    }

    async fn send(
        &self,
        command: Command,
        network_id: NetworkId,
        dst: NetAddress,
        ack_requested: bool,
        scheduled_at: Option<Instant>,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(ErrorKind::Stopped.into());
        }

        let mut packet = Packet::new(network_id, NetAddress::GATEWAY, dst, command);
        packet.scheduled_at = scheduled_at;
        if ack_requested {
            let transmit_now = self.acks().register(&mut packet, Instant::now())?;
            if !transmit_now {
                debug!("queued behind pending packets for {}: {}", dst, packet);
                return Ok(());
            }
        }
        self.buffer.put(packet, &self.running).await
    }

    async fn send_broadcast(&self, command: Command) -> Result<()> {
        self.send(
            command,
            NetworkId::BROADCAST,
            NetAddress::BROADCAST,
            false,
            None,
        )
        .await
    }

    async fn enqueue(&self, packet: Packet) {
        if let Err(error) = self.buffer.put(packet, &self.running).await {
            debug!("dropping packet: {}", error);
        }
    }

    /// Puts `packet` on every started transport.
    async fn transmit(&self, packet: &Packet) {
        let mut sent = false;
        for link in &self.links {
            if !link.transport.is_started() {
                continue;
            }
            match link.transport.send_packet(packet).await {
                Ok(()) => sent = true,
                Err(error) => {
                    error!("failed to send {}: {}", packet, error);
                    link.reset.notify_one();
                }
            }
        }
        if !sent {
            warn!("no transport took {}", packet);
        }
    }

    async fn set_radio_channel(&self, channel: Channel) -> Result<()> {
        if channel >= MAX_CHANNELS {
            return Err(ErrorKind::ChannelOutOfRange(channel).into());
        }

        {
            let mut radio = self.radio();
            radio.channel = Some(channel);
            radio.selected = true;
        }
        info!("radio channel {}", channel);
        self.broadcast_setup().await
    }

    async fn broadcast_setup(&self) -> Result<()> {
        let channel = self.radio().channel;
        let channel = match channel {
            Some(channel) => channel,
            None => {
                debug!("no channel to announce yet");
                return Ok(());
            }
        };
        let setup = NetMgmtCommand::Setup {
            network_id: self.config.network_id,
            channel,
        };
        self.send_broadcast(Command::NetMgmt(setup)).await
    }

    async fn select_channel(&self) -> Result<Channel> {
        let (checks, mut responses) = mpsc::unbounded_channel();
        *self.survey() = Some(checks);
        let result = self.survey_channels(&mut responses).await;
        *self.survey() = None;

        let survey = result?;
        for channel in 0..MAX_CHANNELS {
            if let Some(info) = survey.info(channel) {
                debug!(
                    "channel {}: {} controllers, energy {}",
                    channel, info.controller_count, info.channel_energy
                );
            }
        }

        let channel = survey.best();
        info!("selected channel {}", channel);
        self.set_radio_channel(channel).await?;
        Ok(channel)
    }

    async fn survey_channels(
        &self,
        responses: &mut mpsc::UnboundedReceiver<NetCheck>,
    ) -> Result<ChannelSurvey> {
        let mut running = self.running_watch.subscribe();
        let mut survey = ChannelSurvey::new();

        for channel in 0..MAX_CHANNELS {
            survey.reset(channel);
            let check = NetCheck {
                check_type: CheckType::Request,
                network_id: NetworkId::BROADCAST,
                guid: NetGuid::PRIVATE,
                channel,
                energy: 0,
                link_quality: 0,
            };
            self.send_broadcast(Command::NetMgmt(NetMgmtCommand::Check(check)))
                .await?;

            let deadline = tokio::time::sleep(self.config.netcheck_delay());
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    response = responses.recv() => match response {
                        Some(response) => survey.record(&response),
                        None => break,
                    },
                    _ = &mut deadline => break,
                    _ = until_stopped(&mut running) => return Err(ErrorKind::Stopped.into()),
                }
            }
        }

        Ok(survey)
    }

    async fn handle_packet(&self, packet: Packet) {
        let now = Instant::now();
        self.associations.touch(packet.src, now);

        let command = match packet.payload {
            Payload::Ack(ref ack) => {
                self.handle_ack(packet.src, packet.ack_id, ack.data, now)
                    .await;
                return;
            }
            Payload::Command(ref command) => command.clone(),
        };

        if packet.ack_id != EMPTY_ACK_ID {
            match self.associations.accept_ack_id(packet.src, packet.ack_id) {
                None => {
                    warn!("ignoring packet from unknown address {}", packet.src);
                    return;
                }
                Some(new) => {
                    self.acknowledge_inbound(&packet).await;
                    if !new {
                        warn!("acked but not processing repeat of {}", packet);
                        return;
                    }
                }
            }
        }

        self.handle_command(packet.src, command, now).await;
    }

    async fn handle_ack(
        &self,
        src: NetAddress,
        ack_id: AckId,
        data: [u8; ACK_DATA_BYTES],
        now: Instant,
    ) {
        let acknowledged = self.acks().acknowledge(src, ack_id, data, now);
        match acknowledged {
            Some(Acknowledged { packet, next }) => {
                info!("acked {}", packet);
                if let Some(next) = next {
                    self.enqueue(next).await;
                }
            }
            None => warn!("unmatched ack {} from {}", ack_id, src),
        }
    }

    async fn acknowledge_inbound(&self, packet: &Packet) {
        debug!("acking {} from {}", packet.ack_id, packet.src);
        let ack = Packet::new_ack(
            packet.network_id,
            NetAddress::GATEWAY,
            packet.src,
            packet.ack_id,
            [0; ACK_DATA_BYTES],
        );
        self.enqueue(ack).await;
    }

    async fn handle_command(&self, src: NetAddress, command: Command, now: Instant) {
        let result = match command {
            Command::NetMgmt(NetMgmtCommand::Setup { .. }) => {
                info!("radio asked for network setup");
                self.broadcast_setup().await
            }
            Command::NetMgmt(NetMgmtCommand::Check(check)) => self.handle_net_check(check).await,
            Command::NetMgmt(NetMgmtCommand::IntfTest { number }) => {
                debug!("interface test {} answered", number);
                self.intf_check_pending.store(false, Ordering::SeqCst);
                Ok(())
            }
            Command::Assoc(AssocCommand::Req(req)) => {
                match self.associations.on_assoc_req(src, &req, now) {
                    Some(outcome) => {
                        info!("assigning {}", outcome.device);
                        self.send_broadcast(outcome.response).await
                    }
                    None => Ok(()),
                }
            }
            Command::Assoc(AssocCommand::Check(check)) => {
                let outcome = self
                    .associations
                    .on_assoc_check(src, &check, now, |address| self.acks().clear(address));
                match outcome {
                    Some(outcome) => {
                        let network_id = self.config.network_id;
                        self.send(outcome.reply, network_id, src, false, None).await
                    }
                    None => Ok(()),
                }
            }
            Command::Assoc(AssocCommand::Resp(_)) | Command::Assoc(AssocCommand::Ack(_)) => Ok(()),
            Command::Info(InfoCommand::Response(message)) => {
                let query_id = message.query_id;
                if self.queries.resolve_success(&query_id, message).is_some() {
                    warn!("response to unknown query {:#010x} from {}", query_id, src);
                }
                Ok(())
            }
            Command::Info(InfoCommand::Query(message)) => {
                debug!("ignoring query {:#010x} from {}", message.query_id, src);
                Ok(())
            }
            Command::Control(control) => {
                match self.associations.device_at(src) {
                    Some(device) => {
                        self.listener()
                            .on_control_command(src, Some(&device), &control)
                    }
                    None => debug!("control command from unknown address {}", src),
                }
                Ok(())
            }
        };

        if let Err(error) = result {
            error!("handling command from {}: {}", src, error);
        }
    }

    async fn handle_net_check(&self, check: NetCheck) -> Result<()> {
        match check.check_type {
            CheckType::Request => {
                // Answer scans so other controllers count us, and checks aimed at our network.
                let guid = if check.network_id.is_broadcast() {
                    NetGuid::PRIVATE
                } else if check.network_id == self.config.network_id {
                    check.guid
                } else {
                    return Ok(());
                };
                let response = NetCheck {
                    check_type: CheckType::Response,
                    guid,
                    energy: 0,
                    link_quality: 0,
                    ..check
                };
                self.send_broadcast(Command::NetMgmt(NetMgmtCommand::Check(response)))
                    .await
            }
            CheckType::Response if check.network_id.is_broadcast() => {
                let survey = self.survey().clone();
                match survey {
                    Some(survey) => {
                        let _ = survey.send(check);
                    }
                    None => debug!("channel check response outside a scan: {:?}", check),
                }
                Ok(())
            }
            CheckType::Response => Ok(()),
        }
    }

    async fn sweep_acks(&self, now: Instant) {
        let sweep = self.acks().sweep(now);
        for packet in sweep.exhausted {
            warn!("no ack after {} sends: {}", packet.send_count, packet);
        }
        for packet in sweep.transmit {
            self.enqueue(packet).await;
        }
    }

    async fn sweep_queries(&self, now: Instant) {
        let associations = &self.associations;
        let resend = self.queries.sweep(
            now,
            |(dst, _)| match associations.device_at(*dst) {
                Some(device) => device.state != NetworkDeviceState::Lost,
                None => true,
            },
            |query_id| ErrorKind::QueryExpired(*query_id).into(),
        );

        let network_id = self.config.network_id;
        for (query_id, (dst, command)) in resend {
            debug!("resending query {:#010x} to {}", query_id, dst);
            if let Err(error) = self.send(command, network_id, dst, false, None).await {
                error!("resending query {:#010x}: {}", query_id, error);
            }
        }
    }

    /// Sends a heartbeat to the radio, or resets the transports if the last one went unanswered.
    async fn check_interface(&self) {
        if self.intf_check_pending.swap(false, Ordering::SeqCst) {
            warn!("interface test unanswered, resetting transports");
            for link in &self.links {
                link.reset.notify_one();
            }
            return;
        }

        let test = NetMgmtCommand::IntfTest {
            number: self.intf_tests.next(),
        };
        let network_id = self.config.network_id;
        match self
            .send(Command::NetMgmt(test), network_id, NetAddress::BROADCAST, false, None)
            .await
        {
            Ok(()) => self.intf_check_pending.store(true, Ordering::SeqCst),
            Err(error) => debug!("interface test not sent: {}", error),
        }
    }
}

/// Sleeps until shortly before `deadline`, then yields until it has passed.
async fn wait_until(deadline: Instant) {
    if let Some(coarse) = deadline.checked_sub(SPIN_WINDOW) {
        tokio::time::sleep_until(coarse).await;
    }
    while Instant::now() < deadline {
        tokio::task::yield_now().await;
    }
}

/// Task reading packets from one transport and dispatching them.
///
/// Resets the transport when it fails or when asked to.
struct Rx {
    shared: Arc<Shared>,
    index: usize,
}

impl Rx {
    async fn task(self) {
        let shared = &self.shared;
        let link = &shared.links[self.index];
        let mut running = shared.running_watch.subscribe();
        let network_id = shared.config.network_id;

        while shared.is_running() {
            if !link.transport.is_started() {
                tokio::select! {
                    _ = tokio::time::sleep(shared.config.receive_backoff()) => {}
                    _ = link.reset.notified() => self.reset(&mut running).await,
                    _ = until_stopped(&mut running) => break,
                }
                continue;
            }

            let result = tokio::select! {
                result = link.transport.receive_packet(network_id) => result,
                _ = link.reset.notified() => {
                    self.reset(&mut running).await;
                    continue;
                }
                _ = until_stopped(&mut running) => break,
            };

            match result {
                Ok(Some(packet)) => shared.handle_packet(packet).await,
                Ok(None) => {}
                Err(error) => {
                    error!("receive failed: {}", error);
                    self.reset(&mut running).await;
                }
            }
        }

        debug!("receiver {} stopped", self.index);
    }

    async fn reset(&self, running: &mut watch::Receiver<bool>) {
        let transport = &self.shared.links[self.index].transport;
        tokio::select! {
            result = transport.reset() => {
                if let Err(error) = result {
                    error!("transport reset failed: {}", error);
                }
            }
            _ = until_stopped(running) => {}
        }
    }
}

/// Task draining the send buffer onto the transports.
///
/// Packets scheduled for later are held aside in due order while unscheduled traffic keeps
/// flowing, then sent as close to their time as possible.
struct Tx {
    shared: Arc<Shared>,
    scheduled: Vec<Packet>,
}

impl Tx {
    async fn task(mut self) {
        let shared = self.shared.clone();
        let mut running = shared.running_watch.subscribe();

        while shared.is_running() {
            self.transmit_due().await;

            let mut drained = 0;
            while drained <= shared.config.high_water {
                let packet = match shared.buffer.take() {
                    Some(packet) => packet,
                    None => break,
                };
                match packet.scheduled_at {
                    Some(at) if at > Instant::now() => self.hold(packet, at),
                    _ => shared.transmit(&packet).await,
                }
                drained += 1;
                self.transmit_due().await;
            }

            if drained > shared.config.high_water {
                tokio::task::yield_now().await;
                continue;
            }

            let next_due = self.scheduled.first().and_then(|packet| packet.scheduled_at);
            tokio::select! {
                _ = shared.buffer.filled() => {}
                _ = wait_for_due(next_due) => {}
                _ = until_stopped(&mut running) => break,
            }
        }

        if !self.scheduled.is_empty() {
            debug!("dropping {} scheduled packets", self.scheduled.len());
        }
        debug!("sender stopped");
    }

    fn hold(&mut self, packet: Packet, at: Instant) {
        let index = self
            .scheduled
            .iter()
            .position(|held| held.scheduled_at.map_or(false, |due| due > at))
            .unwrap_or_else(|| self.scheduled.len());
        self.scheduled.insert(index, packet);
    }

    /// Sends every held packet whose time has come.
    async fn transmit_due(&mut self) {
        while let Some(at) = self.scheduled.first().and_then(|packet| packet.scheduled_at) {
            if at > Instant::now() {
                break;
            }
            let packet = self.scheduled.remove(0);
            self.shared.transmit(&packet).await;
        }
    }
}

async fn wait_for_due(due: Option<Instant>) {
    match due {
        Some(due) => wait_until(due).await,
        None => std::future::pending().await,
    }
}

/// Task running the periodic sweeps: retries, query timeouts, settled associations, lost devices,
/// and the interface heartbeat.
struct Background {
    shared: Arc<Shared>,
}

impl Background {
    async fn task(self) {
        let shared = &self.shared;
        let mut running = shared.running_watch.subscribe();
        let mut ticks = tokio::time::interval(shared.config.event_interval());
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut next_interface_check = Instant::now() + shared.config.interface_check_interval();

        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = until_stopped(&mut running) => break,
            }
            if !shared.is_running() {
                break;
            }

            let now = Instant::now();
            shared.sweep_queries(now).await;
            shared.sweep_acks(now).await;
            shared.associations.activate_settled(now);
            shared.associations.sweep_lost(now);

            if now >= next_interface_check {
                next_interface_check = now + shared.config.interface_check_interval();
                shared.check_interface().await;
            }
        }

        debug!("background stopped");
    }
}
