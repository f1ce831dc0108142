//! Shore driver: RUDICS call lifecycle and DirectIP MO delivery.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use acomms::clock::{Clock, TimePoint};
use acomms::driver::iridium::RATE_SBD;
use acomms::driver::{DriverConfig, DriverEvent, ModemDriver, NullSource};
use acomms::protocol::{directip, header, rudics};
use acomms::shore::{DirectIpConfig, IridiumShoreDriver, SbdBackendConfig, ShoreConfig};
use acomms::transmission::{ModemTransmission, TransmissionKind};

const IMEI: &str = "300234010753370";

fn shore(clock: Clock) -> IridiumShoreDriver {
    let cfg = DriverConfig {
        modem_id: 1,
        ..Default::default()
    };
    let mut driver = IridiumShoreDriver::new(
        cfg,
        ShoreConfig {
            rudics_server_bind: "127.0.0.1".into(),
            rudics_server_port: 0,
            sbd: SbdBackendConfig::DirectIp(DirectIpConfig {
                mo_server_bind: "127.0.0.1".into(),
                mo_server_port: 0,
                mt_server_address: "127.0.0.1".into(),
                mt_server_port: 1, // unused in these tests
            }),
            modem_id_to_imei: vec![(2, IMEI.into())],
            ..Default::default()
        },
        clock,
    );
    driver.startup().unwrap();
    driver
}

fn drain_rx(driver: &mut IridiumShoreDriver) -> Vec<ModemTransmission> {
    let mut out = Vec::new();
    while let Some(ev) = driver.poll_event() {
        if let DriverEvent::Receive(m) = ev {
            out.push(m);
        }
    }
    out
}

fn read_packet(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    for _ in 0..500 {
        match stream.read(&mut chunk) {
            Ok(0) => return None,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.contains(&b'\r') {
                    let pos = buf.iter().position(|b| *b == b'\r').unwrap();
                    return Some(buf[..=pos].to_vec());
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(_) => return None,
        }
    }
    None
}

#[test]
fn rudics_call_maps_acks_and_hangs_up() {
    let clock = Clock::simulated(TimePoint::from_unix_seconds(0));
    let mut driver = shore(clock.clone());
    let port = driver.rudics_local_port().unwrap();

    let mut mobile = TcpStream::connect(("127.0.0.1", port)).unwrap();
    mobile.set_nonblocking(true).unwrap();
    mobile.write_all(b"goby\r").unwrap();

    // a data transmission from modem 2, requesting an ACK
    let msg = ModemTransmission {
        src: 2,
        dest: 1,
        rate: RATE_SBD,
        kind: TransmissionKind::Data,
        ack_requested: Some(true),
        frame_start: Some(0),
        frames: vec![b"hello shore".to_vec()],
        ..Default::default()
    };
    let packet = rudics::encode(&header::serialize_modem_message(&msg).unwrap());
    mobile.write_all(&packet).unwrap();

    let mut received = Vec::new();
    for _ in 0..500 {
        driver.do_work(&mut NullSource).unwrap();
        received.extend(drain_rx(&mut driver));
        if !received.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].frames, vec![b"hello shore".to_vec()]);

    // the ACK comes back over the now-mapped connection
    let ack_packet = read_packet(&mut mobile).expect("ack packet");
    let ack = header::parse_modem_message(&rudics::decode(&ack_packet).unwrap()).unwrap();
    assert_eq!(ack.kind, TransmissionKind::Ack);
    assert_eq!(ack.src, 1);
    assert_eq!(ack.dest, 2);
    assert_eq!(ack.acked_frames, vec![0]);

    // the mobile says bye; after the handshake timeout the shore says
    // bye too and hangs up by disconnecting
    mobile.write_all(b"bye\r").unwrap();
    for _ in 0..50 {
        driver.do_work(&mut NullSource).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    clock.advance(Duration::from_secs(31));
    let mut disconnected = false;
    let mut bye_seen = false;
    for _ in 0..500 {
        driver.do_work(&mut NullSource).unwrap();
        let mut chunk = [0u8; 256];
        match mobile.read(&mut chunk) {
            Ok(0) => {
                disconnected = true;
                break;
            }
            Ok(n) => {
                if chunk[..n].windows(4).any(|w| w == b"bye\r") {
                    bye_seen = true;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => {
                disconnected = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(bye_seen, "shore must answer the bye handshake");
    assert!(disconnected, "shore must hang up by disconnecting");
}

#[test]
fn directip_mo_delivery_reaches_the_application() {
    let clock = Clock::real();
    let mut driver = shore(clock);

    let mo_port = driver
        .directip_mo_port()
        .expect("DirectIP backend should be listening");

    let inbound = ModemTransmission {
        src: 2,
        dest: 1,
        rate: RATE_SBD,
        kind: TransmissionKind::Data,
        frames: vec![b"sbd inbound".to_vec()],
        ..Default::default()
    };
    let payload = header::serialize_modem_message(&inbound).unwrap();
    let message = directip::mo_message(&payload, IMEI, 77, 3, 0, 9).unwrap();

    let mut gateway = TcpStream::connect(("127.0.0.1", mo_port)).unwrap();
    gateway.write_all(&message).unwrap();

    let mut received = Vec::new();
    for _ in 0..500 {
        driver.do_work(&mut NullSource).unwrap();
        received.extend(drain_rx(&mut driver));
        if !received.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].src, 2);
    assert_eq!(received[0].frames, vec![b"sbd inbound".to_vec()]);
}
