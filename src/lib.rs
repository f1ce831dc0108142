//! # acomms
//!
//! A library for communication over low-bandwidth, high-latency marine
//! telemetry links: underwater acoustic modems, Iridium satellite
//! (SBD and RUDICS), and plain IP transports used in simulation and
//! topside deployments.
//!
//! The stack is built from four cooperating pieces, all driven from a
//! single thread:
//!
//! * a **TDMA medium access controller** ([`mac`]) that decides *when*
//!   this node may transmit on the shared half-duplex channel;
//! * **modem drivers** ([`driver`], [`shore`]) that own the wire
//!   protocol of a particular hardware family as an explicit state
//!   machine and emit a uniform set of [`driver::DriverEvent`]s;
//! * a **priority queue layer** ([`queue`], [`buffer`]) that chooses, on
//!   demand from a driver, which application payload rides in the next
//!   outgoing frame under destination, size, blackout, TTL and ACK
//!   constraints;
//! * the **portal** ([`portal`]) that binds the three together with
//!   strict ordering rules and owns the event-loop tick.
//!
//! ## Crate features
//! | Feature     | Description |
//! |-------------|-------------|
//! | `rockblock` (default) | RockBLOCK HTTP backend for the shore driver (MT POST client, MO callback endpoint, optional JWT verification) |
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use acomms::clock::Clock;
//! use acomms::codec::RawCodec;
//! use acomms::driver::{Driver, DriverConfig, udp::UdpDriver, udp::UdpDriverConfig};
//! use acomms::line_io::LineIoConfig;
//! use acomms::mac::{MacConfig, MacMode, MacReference};
//! use acomms::portal::Portal;
//! use acomms::queue::{QueueConfig, QueueManager, QueueManagerConfig};
//! use acomms::transmission::{ModemTransmission, TransmissionKind};
//!
//! let clock = Clock::real();
//!
//! // queue layer: one queue for our (raw bytes) message type
//! let mut queues = QueueManager::new(
//!     QueueManagerConfig { modem_id: 1, ..Default::default() },
//!     RawCodec,
//!     clock.clone(),
//! );
//! queues.add_queue(QueueConfig { name: "status".into(), ..Default::default() });
//!
//! // driver: UDP "modem" talking to one peer
//! let cfg = DriverConfig { modem_id: 1, ..Default::default() };
//! let driver = Driver::UdpUnicast(UdpDriver::new(
//!     cfg,
//!     UdpDriverConfig {
//!         local_port: 11145,
//!         remotes: vec![(2, "127.0.0.1:11146".parse().unwrap())],
//!         ..Default::default()
//!     },
//!     clock.clone(),
//! ));
//!
//! // MAC: two 10 s slots, we own the first
//! let mac = MacConfig {
//!     mode: MacMode::FixedDecentralized,
//!     modem_id: 1,
//!     slots: vec![
//!         ModemTransmission::slot(1, 2, 0, TransmissionKind::Data, 10.0),
//!         ModemTransmission::slot(2, 1, 0, TransmissionKind::Data, 10.0),
//!     ],
//!     reference: MacReference::StartOfDay,
//!     ..Default::default()
//! };
//!
//! let mut portal = Portal::new(clock, driver, queues);
//! portal.subscribe_receive(|msg: &Vec<u8>| println!("received {msg:?}"));
//! portal.start(mac).unwrap();
//!
//! portal.push(b"hello".to_vec()).unwrap();
//! loop {
//!     portal.do_work();
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//! ```
//!
//! ## Design notes
//!
//! * Signals are delivered synchronously in-thread: everything a
//!   component emits during its `do_work` is dispatched before the next
//!   component runs.
//! * All timekeeping goes through [`clock::Clock`], which supports a
//!   warp factor for accelerated simulation and a manually stepped mode
//!   for deterministic tests.
//! * Errors never cross a driver boundary except as a
//!   [`transmission::ModemReport`] status consumed by the portal's
//!   reset/backoff policy.

#![deny(
    bad_style,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    while_true,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]

pub use nb;

pub mod buffer;
pub mod clock;
pub mod codec;
pub mod consts;
pub mod driver;
pub mod line_io;
pub mod mac;
pub mod portal;
pub mod protocol;
pub mod queue;
pub mod shore;
pub mod sim;
pub mod transmission;

pub use clock::{Clock, TimePoint};
pub use consts::{BROADCAST_ID, ModemId, QUERY_DESTINATION_ID, QUERY_SOURCE_ID};
pub use transmission::{ModemReport, ModemTransmission, TransmissionKind};
