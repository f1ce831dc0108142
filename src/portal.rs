//! The binder: one driver, one MAC, one queue manager, one thread.
//!
//! [`Portal::do_work`] runs one cooperative tick in the fixed order the
//! stack depends on: driver first, then the MAC (whose slot may initiate
//! a transmission on the driver), then queue expiry. Everything a
//! component emitted is dispatched synchronously before the next
//! component runs, so a slot-start notification always precedes the
//! transmission it triggered and receive-order matches wire-order.
//!
//! The portal also owns the driver reset policy: a driver failure marks
//! the link down, `do_work` becomes a no-op for the backoff interval,
//! and then `startup` is retried.
//!
//! For platforms with several physical links, [`DriverThread`] runs one
//! driver + MAC + dynamic buffer per worker thread, talking to the
//! owning thread over bounded channels.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, warn};

use crate::buffer::{BufferValue, DynamicBuffer, SubbufferConfig};
use crate::clock::{Clock, TimePoint};
use crate::codec::Codec;
use crate::consts::ModemId;
use crate::driver::{Driver, DriverError, DriverEvent, DriverOrder, ModemDriver, PayloadSource};
use crate::mac::{MacConfig, MacManager};
use crate::queue::{QueueError, QueueEvent, QueueManager};
use crate::transmission::{DriverStatus, ModemRaw, ModemTransmission};

/// Application-facing callbacks. All fire synchronously from
/// [`Portal::do_work`] (or [`Portal::push`] for loopback traffic).
struct Subscribers<C: Codec> {
    receive: Vec<Box<dyn FnMut(&C::Message)>>,
    ack: Vec<Box<dyn FnMut(&ModemTransmission, &C::Message)>>,
    expire: Vec<Box<dyn FnMut(&C::Message)>>,
    queue_size: Vec<Box<dyn FnMut(u32, usize)>>,
    slot_start: Vec<Box<dyn FnMut(&ModemTransmission)>>,
    raw_incoming: Vec<Box<dyn FnMut(&ModemRaw)>>,
    raw_outgoing: Vec<Box<dyn FnMut(&ModemRaw)>>,
    status: Vec<Box<dyn FnMut(DriverStatus)>>,
}

impl<C: Codec> Default for Subscribers<C> {
    fn default() -> Self {
        Subscribers {
            receive: Vec::new(),
            ack: Vec::new(),
            expire: Vec::new(),
            queue_size: Vec::new(),
            slot_start: Vec::new(),
            raw_incoming: Vec::new(),
            raw_outgoing: Vec::new(),
            status: Vec::new(),
        }
    }
}

impl<C: Codec> Subscribers<C> {
    fn dispatch_queue_event(&mut self, event: QueueEvent<C::Message>) {
        match event {
            QueueEvent::Receive(msg) => {
                for f in &mut self.receive {
                    f(&msg);
                }
            }
            QueueEvent::Ack { ack, orig } => {
                for f in &mut self.ack {
                    f(&ack, &orig);
                }
            }
            QueueEvent::Expire(orig) => {
                for f in &mut self.expire {
                    f(&orig);
                }
            }
            QueueEvent::QueueSizeChange { message_id, size } => {
                for f in &mut self.queue_size {
                    f(message_id, size);
                }
            }
        }
    }
}

pub struct Portal<C: Codec> {
    clock: Clock,
    driver: Driver,
    queues: QueueManager<C>,
    mac: MacManager,
    subscribers: Subscribers<C>,
    driver_backoff: Duration,
    down_until: Option<TimePoint>,
    started: bool,
    order: DriverOrder,
    driver_order: Option<u32>,
}

impl<C: Codec> fmt::Debug for Portal<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal")
            .field("driver", &self.driver)
            .field("mac_running", &self.mac.running())
            .field("down_until", &self.down_until)
            .finish_non_exhaustive()
    }
}

impl<C: Codec> Portal<C> {
    pub fn new(clock: Clock, driver: Driver, queues: QueueManager<C>) -> Self {
        let mac = MacManager::new(clock.clone());
        Portal {
            clock,
            driver,
            queues,
            mac,
            subscribers: Subscribers::default(),
            driver_backoff: Duration::from_secs(10),
            down_until: None,
            started: false,
            order: DriverOrder::new(),
            driver_order: None,
        }
    }

    /// Position of this portal's driver in the startup order (1-based);
    /// `None` before [`Portal::start`].
    pub fn driver_order(&self) -> Option<u32> {
        self.driver_order
    }

    /// The shared order counter, for wiring additional links
    /// ([`DriverThread`]) into the same registry.
    pub fn order_counter(&self) -> DriverOrder {
        self.order.clone()
    }

    /// How long a failed driver stays down before `startup` is retried.
    pub fn set_driver_backoff(&mut self, backoff: Duration) {
        self.driver_backoff = backoff;
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn queues(&mut self) -> &mut QueueManager<C> {
        &mut self.queues
    }

    pub fn mac(&mut self) -> &mut MacManager {
        &mut self.mac
    }

    /// Current driver health.
    pub fn report(&self) -> crate::transmission::ModemReport {
        self.driver.report()
    }

    pub fn subscribe_receive(&mut self, f: impl FnMut(&C::Message) + 'static) {
        self.subscribers.receive.push(Box::new(f));
    }

    pub fn subscribe_ack(&mut self, f: impl FnMut(&ModemTransmission, &C::Message) + 'static) {
        self.subscribers.ack.push(Box::new(f));
    }

    pub fn subscribe_expire(&mut self, f: impl FnMut(&C::Message) + 'static) {
        self.subscribers.expire.push(Box::new(f));
    }

    pub fn subscribe_queue_size(&mut self, f: impl FnMut(u32, usize) + 'static) {
        self.subscribers.queue_size.push(Box::new(f));
    }

    pub fn subscribe_slot_start(&mut self, f: impl FnMut(&ModemTransmission) + 'static) {
        self.subscribers.slot_start.push(Box::new(f));
    }

    pub fn subscribe_raw_incoming(&mut self, f: impl FnMut(&ModemRaw) + 'static) {
        self.subscribers.raw_incoming.push(Box::new(f));
    }

    pub fn subscribe_raw_outgoing(&mut self, f: impl FnMut(&ModemRaw) + 'static) {
        self.subscribers.raw_outgoing.push(Box::new(f));
    }

    pub fn subscribe_status(&mut self, f: impl FnMut(DriverStatus) + 'static) {
        self.subscribers.status.push(Box::new(f));
    }

    /// Start the driver and the MAC. A driver failure engages the
    /// backoff/retry policy rather than propagating.
    pub fn start(&mut self, mac_cfg: MacConfig) -> Result<(), DriverError> {
        self.started = true;
        if self.driver_order.is_none() {
            self.driver_order = Some(self.order.next());
        }
        self.mac.startup(mac_cfg);
        if let Err(e) = self.driver.startup() {
            self.mark_down(e);
        }
        self.drain_driver_events();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.started = false;
        self.mac.shutdown();
        self.driver.shutdown();
        self.drain_driver_events();
    }

    /// Queue a message for transmission (or loop it back if it is
    /// addressed to this node). Logical queue errors surface here; the
    /// caller may discard them.
    pub fn push(&mut self, msg: C::Message) -> Result<(), QueueError> {
        let result = self.queues.push_message(msg);
        let subs = &mut self.subscribers;
        while let Some(event) = self.queues.poll_event() {
            subs.dispatch_queue_event(event);
        }
        result
    }

    fn mark_down(&mut self, error: DriverError) {
        warn!("driver failed: {error}; backing off {:?}", self.driver_backoff);
        self.down_until = Some(self.clock.now() + self.driver_backoff);
    }

    fn drain_driver_events(&mut self) {
        let subs = &mut self.subscribers;
        while let Some(event) = self.driver.poll_event() {
            match event {
                DriverEvent::Receive(msg) => {
                    self.queues.handle_modem_receive(&msg);
                }
                DriverEvent::TransmitResult(msg) => {
                    debug!("transmit complete: {} frame(s)", msg.frames.len());
                }
                DriverEvent::RawIncoming(raw) => {
                    for f in &mut subs.raw_incoming {
                        f(&raw);
                    }
                }
                DriverEvent::RawOutgoing(raw) => {
                    for f in &mut subs.raw_outgoing {
                        f(&raw);
                    }
                }
                DriverEvent::StatusChange(status) => {
                    for f in &mut subs.status {
                        f(status);
                    }
                }
            }
        }
        while let Some(event) = self.queues.poll_event() {
            subs.dispatch_queue_event(event);
        }
    }

    /// One cooperative tick: driver, then MAC, then queue expiry.
    pub fn do_work(&mut self) {
        if !self.started {
            return;
        }

        // reset policy: stay down through the backoff, then retry
        if let Some(until) = self.down_until {
            if self.clock.now() < until {
                return;
            }
            self.down_until = None;
            debug!("backoff elapsed; restarting driver");
            if let Err(e) = self.driver.startup() {
                self.mark_down(e);
            }
            self.drain_driver_events();
            return;
        }

        if let Err(e) = self.driver.do_work(&mut self.queues) {
            self.driver.shutdown();
            self.mark_down(e);
        }
        self.drain_driver_events();

        if let Some(tick) = self.mac.do_work() {
            for f in &mut self.subscribers.slot_start {
                f(&tick.slot);
            }
            if tick.initiate && self.down_until.is_none() {
                if let Err(e) =
                    self.driver.handle_initiate_transmission(&tick.slot, &mut self.queues)
                {
                    self.driver.shutdown();
                    self.mark_down(e);
                }
            }
            self.drain_driver_events();
        }

        self.queues.do_work();
        self.drain_driver_events();
    }
}

// ---- multi-link worker ----------------------------------------------

/// The link worker is gone or its command channel is backlogged.
#[derive(Debug, thiserror::Error)]
#[error("link worker unavailable or backlogged")]
pub struct LinkSendError;

/// Commands into a [`DriverThread`].
#[derive(Debug)]
pub enum LinkCommand {
    /// Buffer bytes for `(dest, subbuffer)` on this link.
    Push {
        dest: ModemId,
        subbuffer: String,
        data: Vec<u8>,
    },
    Shutdown,
}

/// Notifications out of a [`DriverThread`].
#[derive(Debug)]
pub enum LinkEvent {
    Receive(ModemTransmission),
    Status(DriverStatus),
    /// A buffered value exceeded its TTL before delivery.
    Expire(BufferValue),
}

/// Serves driver data requests straight from a [`DynamicBuffer`],
/// recording which values rode which frame so ACKs can erase them.
#[derive(Debug)]
struct BufferSource<'a> {
    buffer: &'a mut DynamicBuffer,
    sent: &'a mut Vec<(u32, BufferValue)>,
}

impl PayloadSource for BufferSource<'_> {
    fn modify_transmission(&mut self, _msg: &mut ModemTransmission) {}

    fn data_request(&mut self, msg: &mut ModemTransmission) {
        let Some(max_bytes) = msg.max_frame_bytes else {
            return;
        };
        let start = msg.frame_start.unwrap_or(0);
        while (msg.frames.len() as u32) < msg.max_num_frames.max(1) {
            let Some(value) = self.buffer.top(msg.dest, max_bytes as usize) else {
                break;
            };
            let frame_number = start + msg.frames.len() as u32;
            if msg.dest == crate::consts::QUERY_DESTINATION_ID {
                msg.dest = value.dest;
            }
            msg.frames.push(value.data.clone());
            self.sent.push((frame_number, value));
        }
    }
}

/// One physical link on its own worker thread: a private driver, MAC
/// and dynamic buffer, fed and drained over bounded channels.
#[derive(Debug)]
pub struct DriverThread {
    commands: Sender<LinkCommand>,
    events: Receiver<LinkEvent>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DriverThread {
    const CHANNEL_CAPACITY: usize = 256;
    const TICK: Duration = Duration::from_millis(10);

    pub fn spawn(
        mut driver: Driver,
        mac_cfg: MacConfig,
        subbuffers: Vec<(ModemId, String, SubbufferConfig)>,
        clock: Clock,
    ) -> DriverThread {
        let (cmd_tx, cmd_rx) = bounded::<LinkCommand>(Self::CHANNEL_CAPACITY);
        let (ev_tx, ev_rx) = bounded::<LinkEvent>(Self::CHANNEL_CAPACITY);

        let handle = std::thread::spawn(move || {
            let mut mac = MacManager::new(clock.clone());
            let mut buffer = DynamicBuffer::new(clock.clone());
            for (dest, id, cfg) in subbuffers {
                if let Err(e) = buffer.create(dest, id, cfg) {
                    warn!("could not create subbuffer: {e}");
                }
            }
            mac.startup(mac_cfg);
            if let Err(e) = driver.startup() {
                warn!("link driver failed to start: {e}");
                let _ = ev_tx.try_send(LinkEvent::Status(e.status()));
            }

            // values out for delivery, keyed by driver frame number
            let mut sent: Vec<(u32, BufferValue)> = Vec::new();

            loop {
                let mut shutdown = false;
                while let Ok(command) = cmd_rx.try_recv() {
                    match command {
                        LinkCommand::Push {
                            dest,
                            subbuffer,
                            data,
                        } => {
                            if let Err(e) = buffer.push(dest, &subbuffer, data) {
                                warn!("buffer push failed: {e}");
                            }
                        }
                        LinkCommand::Shutdown => shutdown = true,
                    }
                }
                if shutdown {
                    driver.shutdown();
                    return;
                }

                {
                    let mut source = BufferSource {
                        buffer: &mut buffer,
                        sent: &mut sent,
                    };
                    if let Err(e) = driver.do_work(&mut source) {
                        warn!("link driver failed: {e}");
                        let _ = ev_tx.try_send(LinkEvent::Status(e.status()));
                    }

                    if let Some(tick) = mac.do_work() {
                        if tick.initiate {
                            if let Err(e) =
                                driver.handle_initiate_transmission(&tick.slot, &mut source)
                            {
                                warn!("link transmission failed: {e}");
                            }
                        }
                    }
                }

                while let Some(event) = driver.poll_event() {
                    match event {
                        DriverEvent::Receive(msg) => {
                            // erase delivered values on their ACK
                            if msg.kind == crate::transmission::TransmissionKind::Ack {
                                for frame in &msg.acked_frames {
                                    sent.retain(|(f, value)| {
                                        if f == frame {
                                            let _ = buffer.erase(value);
                                            false
                                        } else {
                                            true
                                        }
                                    });
                                }
                            }
                            match ev_tx.try_send(LinkEvent::Receive(msg)) {
                                Ok(()) | Err(TrySendError::Full(_)) => {}
                                Err(TrySendError::Disconnected(_)) => {
                                    driver.shutdown();
                                    return;
                                }
                            }
                        }
                        DriverEvent::StatusChange(status) => {
                            let _ = ev_tx.try_send(LinkEvent::Status(status));
                        }
                        _ => {}
                    }
                }

                for value in buffer.expire() {
                    let _ = ev_tx.try_send(LinkEvent::Expire(value));
                }

                std::thread::sleep(Self::TICK);
            }
        });

        DriverThread {
            commands: cmd_tx,
            events: ev_rx,
            handle: Some(handle),
        }
    }

    /// Buffer data on the link. Fails when the worker is gone or the
    /// channel is full.
    pub fn push(
        &self,
        dest: ModemId,
        subbuffer: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<(), LinkSendError> {
        self.commands
            .try_send(LinkCommand::Push {
                dest,
                subbuffer: subbuffer.into(),
                data,
            })
            .map_err(|_| LinkSendError)
    }

    /// Pending notifications from the link.
    pub fn poll_event(&self) -> Option<LinkEvent> {
        self.events.try_recv().ok()
    }

    pub fn shutdown(&mut self) {
        let _ = self.commands.try_send(LinkCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DriverThread {
    fn drop(&mut self) {
        let _ = self.commands.try_send(LinkCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
