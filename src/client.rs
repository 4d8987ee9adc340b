//! A session with one 7k device.
//!
//! [`Client`] owns both transports, every receive loop and the state they share with the
//! calling code. Nothing here is global, so several clients can talk to several devices.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::command::{Command, CommandLink, DeliveryKind};
use crate::cycle::{CycleConfig, DiagnosticCycle};
use crate::demux::{Demultiplexer, DiagnosticSlots, PingBundle, RawCapture, RecordSink};
use crate::error::{Error, Result};
use crate::frame::FrameEncoder;
use crate::record::{Record, RecordType, SystemSettings};
use crate::sweep::{run_sweep, SettingField, SweepCounter, SweepPlan, SweepReport};
use crate::transport::{send_datagram, spawn_udp_receiver, ReceiveLoop, TcpChannel};

/// Port the 7k center listens on
pub const DEFAULT_DEVICE_PORT: u16 = 7000;
/// The device id of a 7125
pub const DEFAULT_DEVICE_ID: u32 = 7125;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub device_ip: Ipv4Addr,
    pub device_port: u16,
    pub device_id: u32,
    /// System enumerator, selects the frequency head on dual frequency sonars
    pub enumerator: u16,
    /// Address reported to the device in record requests. Unspecified means the address
    /// the TCP connection goes out on.
    pub own_ip: Ipv4Addr,
    pub udp_read_timeout: Duration,
    pub tcp_read_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long to wait for the answer to a single request
    pub reply_timeout: Duration,
    /// Ping bundles buffered before new ones are dropped
    pub bundle_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_ip: Ipv4Addr::LOCALHOST,
            device_port: DEFAULT_DEVICE_PORT,
            device_id: DEFAULT_DEVICE_ID,
            enumerator: 0,
            own_ip: Ipv4Addr::UNSPECIFIED,
            udp_read_timeout: Duration::from_secs(1),
            tcp_read_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(5),
            bundle_capacity: 64,
        }
    }
}

impl ClientConfig {
    pub fn device_addr(&self) -> SocketAddr {
        SocketAddr::from((self.device_ip, self.device_port))
    }
}

/// Which transport a command goes out on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Tcp,
    Udp,
}

/// A device-side push subscription to one of our ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub port: u16,
    pub records: Vec<RecordType>,
    pub kind: DeliveryKind,
}

/// State the receive loops write and calling code reads
struct Shared {
    bundle_tx: Sender<PingBundle>,
    bundle_rx: Receiver<PingBundle>,
    reply_tx: Sender<Record>,
    reply_rx: Receiver<Record>,
    slots: Arc<DiagnosticSlots>,
    sweep: Arc<SweepCounter>,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        let (bundle_tx, bundle_rx) = bounded(capacity);
        let (reply_tx, reply_rx) = bounded(capacity);
        Self {
            bundle_tx,
            bundle_rx,
            reply_tx,
            reply_rx,
            slots: Arc::new(DiagnosticSlots::default()),
            sweep: Arc::new(SweepCounter::new(SettingField::Gain)),
        }
    }

    fn demultiplexer(&self) -> Demultiplexer {
        Demultiplexer::new(self.bundle_tx.clone(), self.slots.clone())
            .with_replies(self.reply_tx.clone())
    }
}

/// Sends commands over the client's TCP connection. Cheap to clone and hand to threads.
#[derive(Clone)]
pub struct ControlLink {
    tcp: TcpChannel,
    encoder: FrameEncoder,
    shared: Arc<Shared>,
    poll: Duration,
}

impl ControlLink {
    pub fn encoder(&self) -> &FrameEncoder {
        &self.encoder
    }

    fn start_receiver(&self) -> Result<()> {
        self.tcp
            .ensure_receiver(self.poll, self.shared.demultiplexer())
    }
}

impl CommandLink for ControlLink {
    fn send_command(&self, command: &Command) -> Result<()> {
        let message = self.encoder.encode_command(command);
        // Acks come back for every command, keep them drained
        self.start_receiver()?;
        debug!(command = %command.name(), len = message.len(), "sending over TCP");
        self.tcp.send(&message)
    }
}

pub struct Client {
    config: ClientConfig,
    link: ControlLink,
    shared: Arc<Shared>,
    own_ip: Ipv4Addr,
    udp: Option<ReceiveLoop>,
    subscription: Option<Subscription>,
}

impl Client {
    /// Open the TCP connection to the device
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let tcp = TcpChannel::new();
        tcp.connect(config.device_addr(), config.connect_timeout)?;
        let own_ip = match (config.own_ip, tcp.local_addr()?.ip()) {
            (ip, _) if !ip.is_unspecified() => ip,
            (_, IpAddr::V4(local)) => local,
            (ip, IpAddr::V6(_)) => ip,
        };
        info!(device = %config.device_addr(), %own_ip, device_id = config.device_id, "connected");
        let shared = Arc::new(Shared::new(config.bundle_capacity));
        let link = ControlLink {
            tcp,
            encoder: FrameEncoder::new(config.device_id, config.enumerator),
            shared: shared.clone(),
            poll: config.tcp_read_timeout,
        };
        // Read from the start so a hang-up is noticed before the next send
        link.start_receiver()?;
        Ok(Self {
            config,
            link,
            shared,
            own_ip,
            udp: None,
            subscription: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The address the device is told to send to
    pub fn own_ip(&self) -> Ipv4Addr {
        self.own_ip
    }

    pub fn link(&self) -> &ControlLink {
        &self.link
    }

    /// False once the device has closed the connection
    pub fn is_connected(&self) -> bool {
        self.link.tcp.is_connected()
    }

    /// Open a new TCP session after the device dropped the last one.
    ///
    /// The UDP subscription, if any, is left as it was.
    pub fn reconnect(&mut self) -> Result<()> {
        self.link
            .tcp
            .connect(self.config.device_addr(), self.config.connect_timeout)?;
        info!(device = %self.config.device_addr(), "reconnected");
        self.link.start_receiver()
    }

    /// Send one command. Returns the local port it left from, which is where the device
    /// pushes anything the command subscribed to.
    pub fn command(&self, command: &Command, via: Via) -> Result<u16> {
        match via {
            Via::Tcp => {
                self.link.send_command(command)?;
                Ok(self.link.tcp.local_addr()?.port())
            }
            Via::Udp => {
                let message = self.link.encoder.encode_command(command);
                debug!(command = %command.name(), len = message.len(), "sending over UDP");
                send_datagram(
                    SocketAddr::from((self.own_ip, 0)),
                    self.config.device_addr(),
                    &message,
                )
            }
        }
    }

    /// Look up `name` in the command table, build it from `args` and send it
    pub fn send_named(&self, name: &str, args: &[&str], via: Via) -> Result<u16> {
        self.command(&Command::parse(name, args)?, via)
    }

    /// Have the device push `records` over UDP and demultiplex them into ping bundles.
    /// Replaces any earlier UDP subscription.
    pub fn subscribe_udp(&mut self, records: Vec<RecordType>) -> Result<Subscription> {
        let sink = self
            .shared
            .demultiplexer()
            .with_sweep(self.shared.sweep.clone());
        self.subscribe_udp_with(records, sink)
    }

    /// Have the device push `records` over UDP and write them unparsed to `writer`.
    /// Every ping still feeds the sweep counter.
    pub fn capture_udp<W>(&mut self, records: Vec<RecordType>, writer: W) -> Result<Subscription>
    where
        W: Write + Send + 'static,
    {
        let sink = RawCapture::new(writer).with_sweep(self.shared.sweep.clone());
        self.subscribe_udp_with(records, sink)
    }

    fn subscribe_udp_with<S>(&mut self, records: Vec<RecordType>, sink: S) -> Result<Subscription>
    where
        S: RecordSink + 'static,
    {
        if self.subscription.is_some() {
            info!("replacing existing UDP subscription");
            self.unsubscribe()?;
        }
        let port = self.command(&Command::SelfRecordRequest(records.clone()), Via::Udp)?;
        info!(port, records = ?records, "subscribed over UDP");
        let receiver = spawn_udp_receiver(
            SocketAddr::from((self.own_ip, port)),
            self.config.udp_read_timeout,
            sink,
        )?;
        let subscription = Subscription {
            port,
            records,
            kind: DeliveryKind::Udp,
        };
        self.udp = Some(receiver);
        self.subscription = Some(subscription.clone());
        Ok(subscription)
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Cancel the UDP subscription and stop its receive loop
    pub fn unsubscribe(&mut self) -> Result<()> {
        let cancelled = match self.subscription.take() {
            Some(subscription) => self.stop_request(subscription.port, subscription.kind),
            None => Ok(()),
        };
        let stopped = match self.udp.take() {
            Some(receiver) => receiver.stop(),
            None => Ok(()),
        };
        cancelled.and(stopped)
    }

    /// Ask the device to stop pushing to `port`, even for a subscription made elsewhere
    pub fn stop_request(&self, port: u16, kind: DeliveryKind) -> Result<()> {
        info!(port, ?kind, "sending stop request");
        self.link.send_command(&Command::StopRequest {
            ip: self.own_ip,
            port,
            kind,
        })
    }

    /// Fetch the 7503 system settings. `None` when the device doesn't answer in time.
    pub fn request_settings(&self, timeout: Duration) -> Result<Option<SystemSettings>> {
        // Anything queued is an answer to an earlier question
        while self.shared.reply_rx.try_recv().is_ok() {}
        self.link
            .send_command(&Command::SingleRequest(RecordType::SystemSettings))?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(record) = self.shared.reply_rx.recv_timeout(remaining) else {
                warn!("no system settings before timeout");
                return Ok(None);
            };
            if record.record_type == RecordType::SystemSettings {
                return SystemSettings::from_data(record.data()).map(Some);
            }
        }
    }

    /// Address commands sent from now on to another system enumerator
    pub fn set_enumerator(&mut self, enumerator: u16) {
        self.link.encoder.enumerator = enumerator;
        self.config.enumerator = enumerator;
    }

    /// Query the operating frequency and switch to the enumerator that matches it.
    ///
    /// Cycles already started keep the enumerator they were started with.
    pub fn detect_enumerator(&mut self) -> Result<Option<u16>> {
        let Some(settings) = self.request_settings(self.config.reply_timeout)? else {
            return Ok(None);
        };
        match settings.enumerator() {
            Some(enumerator) => {
                info!(frequency = settings.frequency, enumerator, "enumerator set");
                self.set_enumerator(enumerator);
                Ok(Some(enumerator))
            }
            None => {
                warn!(frequency = settings.frequency, "unknown frequency in use");
                Ok(None)
            }
        }
    }

    /// Step through `plan`. Pings are counted from the UDP subscription.
    pub fn run_sweep(&self, plan: &SweepPlan, stop: &AtomicBool) -> Result<SweepReport> {
        if self.subscription.is_none() {
            warn!("sweeping without a UDP subscription, no pings will be counted");
        }
        run_sweep(&self.link, &self.shared.sweep, plan, stop)
    }

    /// Start sampling a diagnostic record in the background
    pub fn start_diagnostic_cycle<F>(&self, config: CycleConfig, processor: F) -> Result<DiagnosticCycle>
    where
        F: FnMut(&Record) -> Option<f32> + Send + 'static,
    {
        DiagnosticCycle::start(self.link.clone(), self.shared.slots.clone(), config, processor)
    }

    /// Ping bundles from every receive loop, in publication order per loop
    pub fn bundles(&self) -> &Receiver<PingBundle> {
        &self.shared.bundle_rx
    }

    /// 7501, 7502 and 7503 records
    pub fn replies(&self) -> &Receiver<Record> {
        &self.shared.reply_rx
    }

    pub fn sweep(&self) -> &Arc<SweepCounter> {
        &self.shared.sweep
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticSlots> {
        &self.shared.slots
    }

    /// Cancel the subscription, stop every loop and close the connection
    pub fn close(&mut self) -> Result<()> {
        let unsubscribed = if self.is_connected() {
            self.unsubscribe()
        } else {
            self.subscription = None;
            match self.udp.take() {
                Some(receiver) => receiver.stop(),
                None => Ok(()),
            }
        };
        let closed = self.link.tcp.close();
        unsubscribed.and(closed)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        match self.close() {
            Ok(()) | Err(Error::ConnectionClosed) => {}
            Err(e) => warn!("closing client: {}", e),
        }
    }
}
