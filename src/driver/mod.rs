//! The driver contract and the closed set of modem drivers.
//!
//! Every driver is a state machine over a [`LineIo`] (or a socket it
//! owns) that implements [`ModemDriver`]: the portal calls
//! `do_work` each tick and `handle_initiate_transmission` on a MAC slot,
//! and drains the driver's [`DriverEvent`]s afterwards. Events are
//! dispatched synchronously, before the next component runs.
//!
//! Payload is *pulled*: when a driver has room in an outgoing
//! transmission it calls back through [`PayloadSource`]
//! (`modify_transmission`, then `data_request`), normally wired to the
//! queue manager.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use thiserror::Error;

use crate::clock::Clock;
use crate::consts::ModemId;
use crate::line_io::{self, LineIo, LineIoConfig, LineIoError, LineIoErrorKind};
use crate::transmission::{DriverStatus, ModemRaw, ModemReport, ModemTransmission};

pub mod abc;
pub mod at;
pub mod benthos;
pub mod iridium;
pub mod store_client;
pub mod udp;
pub mod udp_multicast;

pub use abc::AbcDriver;
pub use benthos::BenthosDriver;
pub use iridium::IridiumDriver;
pub use store_client::StoreClientDriver;
pub use udp::UdpDriver;
pub use udp_multicast::UdpMulticastDriver;

use crate::shore::IridiumShoreDriver;

/// Driver failure, translated by the portal into its reset policy. No
/// error crosses the driver boundary any other way.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("startup failed: {0}")]
    StartupFailed(String),
    #[error("connection to modem failed: {0}")]
    ConnectionFailed(String),
    #[error("modem not responding: {0}")]
    NotResponding(String),
    #[error("invalid driver configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    LineIo(#[from] LineIoError),
}

impl DriverError {
    /// The report status this failure maps to.
    pub fn status(&self) -> DriverStatus {
        match self {
            DriverError::StartupFailed(_) | DriverError::InvalidConfig(_) => {
                DriverStatus::StartupFailed
            }
            DriverError::ConnectionFailed(_) => DriverStatus::ConnectionToModemFailed,
            DriverError::NotResponding(_) => DriverStatus::ModemNotResponding,
            DriverError::LineIo(e) => match e.kind {
                LineIoErrorKind::ConnectionFailed => DriverStatus::StartupFailed,
                _ => DriverStatus::ConnectionToModemFailed,
            },
        }
    }
}

/// Everything a driver tells the rest of the system.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A transmission decoded off the wire.
    Receive(ModemTransmission),
    /// An outgoing transmission left the driver.
    TransmitResult(ModemTransmission),
    /// Raw tee of a line/datagram read from the modem.
    RawIncoming(ModemRaw),
    /// Raw tee of a line/datagram written to the modem.
    RawOutgoing(ModemRaw),
    /// Driver health changed.
    StatusChange(DriverStatus),
}

/// Callback object a driver pulls payload through; the queue manager is
/// the usual implementation. Callbacks run synchronously and must not
/// re-enter the driver.
pub trait PayloadSource {
    /// Lets a third party adjust the mutable transmission fields before
    /// data is requested.
    fn modify_transmission(&mut self, msg: &mut ModemTransmission);

    /// Fill `msg.frames` within `max_frame_bytes`/`max_num_frames`.
    fn data_request(&mut self, msg: &mut ModemTransmission);
}

/// A [`PayloadSource`] with nothing to offer. Useful in tests and for
/// transmissions already carrying their frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSource;

impl PayloadSource for NullSource {
    fn modify_transmission(&mut self, _msg: &mut ModemTransmission) {}
    fn data_request(&mut self, _msg: &mut ModemTransmission) {}
}

/// Configuration shared by every driver; hardware-specific settings live
/// in the individual driver config structs.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub modem_id: ModemId,
    pub connection: LineIoConfig,
    /// End-of-line sequence on the modem's line protocol.
    pub line_delimiter: Vec<u8>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            modem_id: 1,
            connection: LineIoConfig::TcpClient {
                host: "localhost".into(),
                port: 4001,
            },
            line_delimiter: b"\r\n".to_vec(),
        }
    }
}

/// Stable ordering of instantiated drivers within one portal: the first
/// driver started is 1, the second 2, and so on. Clones share the
/// counter, so link worker threads keep the ordering consistent.
#[derive(Debug, Clone, Default)]
pub struct DriverOrder(Arc<AtomicU32>);

impl DriverOrder {
    pub fn new() -> Self {
        DriverOrder::default()
    }

    /// Claim the next position.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// The uniform driver contract (see module docs).
pub trait ModemDriver: fmt::Debug {
    /// Open the modem connection and run the hardware initialisation.
    fn startup(&mut self) -> Result<(), DriverError>;

    /// Replace tunable configuration while running. Default: ignored.
    fn update_cfg(&mut self, cfg: &DriverConfig) {
        let _ = cfg;
        debug!("update_cfg not supported by this driver");
    }

    /// Drain pending work, send the "bye"/hangup where the protocol has
    /// one, close the connection. Subsequent `do_work` calls are no-ops.
    fn shutdown(&mut self);

    /// One cooperative tick. Must return in bounded time.
    fn do_work(&mut self, source: &mut dyn PayloadSource) -> Result<(), DriverError>;

    /// A MAC slot fired for this driver.
    fn handle_initiate_transmission(
        &mut self,
        msg: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError>;

    /// Next pending event, if any.
    fn poll_event(&mut self) -> Option<DriverEvent>;

    /// Modem availability and signal quality as far as known.
    fn report(&self) -> ModemReport;
}

/// Line-interface plumbing shared by the concrete drivers: the
/// [`LineIo`], the event queue, and the health report.
#[derive(Debug)]
pub struct ModemBase {
    cfg: DriverConfig,
    clock: Clock,
    io: Option<Box<dyn LineIo>>,
    events: VecDeque<DriverEvent>,
    report: ModemReport,
}

impl ModemBase {
    pub fn new(cfg: DriverConfig, clock: Clock) -> Self {
        ModemBase {
            cfg,
            clock,
            io: None,
            events: VecDeque::new(),
            report: ModemReport::default(),
        }
    }

    pub fn cfg(&self) -> &DriverConfig {
        &self.cfg
    }

    pub fn set_cfg(&mut self, cfg: DriverConfig) {
        self.cfg = cfg;
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Open the configured connection. Must precede reads/writes.
    pub fn modem_start(&mut self) -> Result<(), DriverError> {
        let mut io = line_io::connect(&self.cfg.connection, &self.cfg.line_delimiter)?;
        if let Err(e) = io.start() {
            self.set_status(DriverStatus::StartupFailed);
            return Err(DriverError::StartupFailed(e.to_string()));
        }
        self.set_status(DriverStatus::Nominal);
        self.io = Some(io);
        Ok(())
    }

    pub fn modem_close(&mut self) {
        if let Some(io) = &mut self.io {
            io.close();
        }
        self.io = None;
    }

    pub fn active(&self) -> bool {
        self.io.as_ref().is_some_and(|io| io.active())
    }

    /// Write one raw line (delimiter included) and tee it out.
    pub fn modem_write(&mut self, data: &[u8]) -> Result<(), DriverError> {
        self.events.push_back(DriverEvent::RawOutgoing(ModemRaw {
            raw: data.to_vec(),
        }));
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| DriverError::ConnectionFailed("modem connection not open".into()))?;
        match io.write(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_status(DriverStatus::ConnectionToModemFailed);
                Err(e.into())
            }
        }
    }

    /// One raw line, if available, teed in. Transport failures mark the
    /// report and read as "nothing available".
    pub fn modem_read(&mut self) -> Option<Vec<u8>> {
        let io = self.io.as_mut()?;
        match io.read() {
            Ok(line) => {
                self.events.push_back(DriverEvent::RawIncoming(ModemRaw {
                    raw: line.clone(),
                }));
                Some(line)
            }
            Err(nb::Error::WouldBlock) => None,
            Err(nb::Error::Other(e)) => {
                warn!("modem read failed: {e}");
                self.set_status(DriverStatus::ConnectionToModemFailed);
                None
            }
        }
    }

    /// DTR control for serial transports (Iridium hangup).
    pub fn set_dtr(&mut self, state: bool) -> Result<(), DriverError> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| DriverError::ConnectionFailed("modem connection not open".into()))?;
        io.set_dtr(state).map_err(DriverError::from)
    }

    pub fn push_event(&mut self, event: DriverEvent) {
        self.events.push_back(event);
    }

    pub fn poll_event(&mut self) -> Option<DriverEvent> {
        self.events.pop_front()
    }

    pub fn report(&self) -> ModemReport {
        self.report
    }

    pub fn report_mut(&mut self) -> &mut ModemReport {
        &mut self.report
    }

    pub fn set_status(&mut self, status: DriverStatus) {
        if self.report.status != status {
            self.report.status = status;
            self.events.push_back(DriverEvent::StatusChange(status));
        }
    }
}

/// The closed set of drivers. Every variant implements the same
/// contract; the enum replaces open-ended virtual dispatch.
#[derive(Debug)]
pub enum Driver {
    Abc(AbcDriver),
    Iridium(IridiumDriver),
    IridiumShore(IridiumShoreDriver),
    UdpUnicast(UdpDriver),
    UdpMulticast(UdpMulticastDriver),
    Benthos(BenthosDriver),
    StoreClient(StoreClientDriver),
}

impl Driver {
    fn inner(&self) -> &dyn ModemDriver {
        match self {
            Driver::Abc(d) => d,
            Driver::Iridium(d) => d,
            Driver::IridiumShore(d) => d,
            Driver::UdpUnicast(d) => d,
            Driver::UdpMulticast(d) => d,
            Driver::Benthos(d) => d,
            Driver::StoreClient(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ModemDriver {
        match self {
            Driver::Abc(d) => d,
            Driver::Iridium(d) => d,
            Driver::IridiumShore(d) => d,
            Driver::UdpUnicast(d) => d,
            Driver::UdpMulticast(d) => d,
            Driver::Benthos(d) => d,
            Driver::StoreClient(d) => d,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Driver::Abc(_) => "ABC_EXAMPLE_MODEM",
            Driver::Iridium(_) => "IRIDIUM",
            Driver::IridiumShore(_) => "IRIDIUM_SHORE",
            Driver::UdpUnicast(_) => "UDP",
            Driver::UdpMulticast(_) => "UDP_MULTICAST",
            Driver::Benthos(_) => "BENTHOS_ATM900",
            Driver::StoreClient(_) => "STORE_SERVER",
        }
    }

    /// Unique driver name, `<TYPE>::<modem_id>`.
    pub fn name(&self, modem_id: ModemId) -> String {
        format!("{}::{modem_id}", self.type_name())
    }
}

impl ModemDriver for Driver {
    fn startup(&mut self) -> Result<(), DriverError> {
        self.inner_mut().startup()
    }

    fn update_cfg(&mut self, cfg: &DriverConfig) {
        self.inner_mut().update_cfg(cfg);
    }

    fn shutdown(&mut self) {
        self.inner_mut().shutdown();
    }

    fn do_work(&mut self, source: &mut dyn PayloadSource) -> Result<(), DriverError> {
        self.inner_mut().do_work(source)
    }

    fn handle_initiate_transmission(
        &mut self,
        msg: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError> {
        self.inner_mut().handle_initiate_transmission(msg, source)
    }

    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.inner_mut().poll_event()
    }

    fn report(&self) -> ModemReport {
        self.inner().report()
    }
}
