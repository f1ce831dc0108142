//! Portal wiring: the driver reset policy and a two-node end-to-end
//! exchange over the simulated ABC channel.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use acomms::clock::{Clock, TimePoint};
use acomms::codec::RawCodec;
use acomms::driver::abc::{AbcDriver, AbcDriverConfig};
use acomms::driver::{Driver, DriverConfig};
use acomms::line_io::{LineIoConfig, MemEndpoint};
use acomms::mac::{MacConfig, MacMode, MacReference};
use acomms::portal::Portal;
use acomms::queue::{QueueConfig, QueueManager, QueueManagerConfig, Role};
use acomms::sim::AbcModemSimulator;
use acomms::transmission::{DriverStatus, ModemTransmission, TransmissionKind};

fn abc_portal(
    modem_id: i32,
    endpoint: MemEndpoint,
    clock: Clock,
    dest: i64,
) -> Portal<RawCodec> {
    let cfg = DriverConfig {
        modem_id,
        connection: LineIoConfig::Mem(endpoint),
        line_delimiter: b"\r\n".to_vec(),
    };
    let driver = Driver::Abc(AbcDriver::new(cfg, AbcDriverConfig::default(), clock.clone()));

    let mut queues = QueueManager::new(
        QueueManagerConfig {
            modem_id,
            ..Default::default()
        },
        RawCodec,
        clock.clone(),
    );
    queues.add_queue(QueueConfig {
        name: format!("raw{modem_id}"),
        message_id: 0,
        dest_role: Role::Static(dest),
        ttl: Duration::from_secs(300),
        ..Default::default()
    });

    Portal::new(clock, driver, queues)
}

fn two_slot_mac(modem_id: i32) -> MacConfig {
    MacConfig {
        mode: MacMode::FixedDecentralized,
        modem_id,
        slots: vec![
            ModemTransmission::slot(1, 2, 0, TransmissionKind::Data, 5.0),
            ModemTransmission::slot(2, 1, 0, TransmissionKind::Data, 5.0),
        ],
        reference: MacReference::Fixed(TimePoint::UNIX_EPOCH),
        start_cycle_in_middle: false,
        allowed_skew: Duration::from_secs(2),
    }
}

#[test]
fn end_to_end_over_the_simulated_channel() {
    let clock = Clock::simulated(TimePoint::from_unix_seconds(11));
    let mut sim = AbcModemSimulator::new();
    let line1 = sim.attach();
    let line2 = sim.attach();

    let mut portal1 = abc_portal(1, line1, clock.clone(), 2);
    let mut portal2 = abc_portal(2, line2, clock.clone(), 1);

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        portal2.subscribe_receive(move |msg: &Vec<u8>| {
            received.borrow_mut().push(msg.clone());
        });
    }
    let slots_seen = Rc::new(RefCell::new(0usize));
    {
        let slots_seen = slots_seen.clone();
        portal1.subscribe_slot_start(move |_slot| {
            *slots_seen.borrow_mut() += 1;
        });
    }

    portal1.start(two_slot_mac(1)).unwrap();
    portal2.start(two_slot_mac(2)).unwrap();
    sim.do_work(); // register the CONF,MAC lines

    portal1.push(b"hello across the water".to_vec()).unwrap();

    for _ in 0..100 {
        clock.advance(Duration::from_millis(250));
        portal1.do_work();
        portal2.do_work();
        sim.do_work();
        portal1.do_work();
        portal2.do_work();
        if !received.borrow().is_empty() {
            break;
        }
    }

    assert_eq!(
        received.borrow().as_slice(),
        &[b"hello across the water".to_vec()]
    );
    assert!(*slots_seen.borrow() > 0, "slot starts must be published");
}

#[test]
fn driver_reset_backs_off_then_retries() {
    let clock = Clock::simulated(TimePoint::from_unix_seconds(100));
    let (ours, mut wire) = MemEndpoint::pair(b"\r\n");
    use acomms::line_io::LineIo;
    wire.start().unwrap();
    ours.set_broken(true);

    let mut portal = abc_portal(1, ours.clone(), clock.clone(), 2);
    portal.set_driver_backoff(Duration::from_secs(5));

    let statuses = Rc::new(RefCell::new(Vec::new()));
    {
        let statuses = statuses.clone();
        portal.subscribe_status(move |s| statuses.borrow_mut().push(s));
    }

    portal.start(two_slot_mac(1)).unwrap();
    assert_eq!(
        statuses.borrow().last(),
        Some(&DriverStatus::StartupFailed),
        "startup failure must be reported"
    );

    // the wire is fixed immediately, but the backoff holds do_work back
    ours.set_broken(false);
    clock.advance(Duration::from_secs(2));
    portal.do_work();
    assert!(
        matches!(wire.read(), Err(acomms::nb::Error::WouldBlock)),
        "no traffic during the backoff"
    );

    // past the backoff, startup is retried and configuration flows
    clock.advance(Duration::from_secs(4));
    portal.do_work();
    let first = wire.read().expect("configuration line after restart");
    assert_eq!(first, b"CONF,MAC:1\r\n".to_vec());
    assert_eq!(statuses.borrow().last(), Some(&DriverStatus::Nominal));
}
