//! Two UDP drivers on loopback: data delivery and the synthesised
//! application-level ACK.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use acomms::clock::Clock;
use acomms::driver::udp::{UdpDriver, UdpDriverConfig};
use acomms::driver::{DriverConfig, DriverEvent, ModemDriver, NullSource};
use acomms::transmission::{ModemTransmission, TransmissionKind};

/// Reserve a free UDP port (bind to 0, note the port, release).
fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn driver(modem_id: i32, local_port: u16, remotes: Vec<(i32, SocketAddr)>) -> UdpDriver {
    let cfg = DriverConfig {
        modem_id,
        ..Default::default()
    };
    let mut d = UdpDriver::new(
        cfg,
        UdpDriverConfig {
            local_port,
            remotes,
            ..Default::default()
        },
        Clock::real(),
    );
    d.startup().unwrap();
    d
}

fn drain(d: &mut UdpDriver) -> Vec<DriverEvent> {
    let mut out = Vec::new();
    while let Some(ev) = d.poll_event() {
        out.push(ev);
    }
    out
}

#[test]
fn data_is_acked_exactly_once() {
    let port_a = free_port();
    let port_b = free_port();
    let mut a = driver(
        1,
        port_a,
        vec![(2, format!("127.0.0.1:{port_b}").parse().unwrap())],
    );
    let mut b = driver(
        2,
        port_b,
        vec![(1, format!("127.0.0.1:{port_a}").parse().unwrap())],
    );

    let msg = ModemTransmission {
        src: 1,
        dest: 2,
        kind: TransmissionKind::Data,
        ack_requested: Some(true),
        frames: vec![b"frame-zero".to_vec()],
        ..Default::default()
    };
    a.handle_initiate_transmission(&msg, &mut NullSource).unwrap();

    let mut received_at_b = Vec::new();
    let mut acks_at_a = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        a.do_work(&mut NullSource).unwrap();
        b.do_work(&mut NullSource).unwrap();
        for ev in drain(&mut b) {
            if let DriverEvent::Receive(m) = ev {
                received_at_b.push(m);
            }
        }
        for ev in drain(&mut a) {
            if let DriverEvent::Receive(m) = ev {
                if m.kind == TransmissionKind::Ack {
                    acks_at_a.push(m);
                }
            }
        }
        if !acks_at_a.is_empty() && !received_at_b.is_empty() {
            // a few more ticks to catch any duplicate
            for _ in 0..50 {
                a.do_work(&mut NullSource).unwrap();
                b.do_work(&mut NullSource).unwrap();
            }
            for ev in drain(&mut a) {
                if let DriverEvent::Receive(m) = ev {
                    if m.kind == TransmissionKind::Ack {
                        acks_at_a.push(m);
                    }
                }
            }
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(received_at_b.len(), 1, "B receives the data exactly once");
    assert_eq!(received_at_b[0].frames, vec![b"frame-zero".to_vec()]);
    assert_eq!(received_at_b[0].frame_start, Some(0));

    assert_eq!(acks_at_a.len(), 1, "A receives exactly one ACK");
    let ack = &acks_at_a[0];
    assert_eq!(ack.src, 2);
    assert_eq!(ack.dest, 1);
    assert_eq!(ack.acked_frames, vec![0]);
}

#[test]
fn no_ack_when_not_requested() {
    let port_a = free_port();
    let port_b = free_port();
    let mut a = driver(
        1,
        port_a,
        vec![(2, format!("127.0.0.1:{port_b}").parse().unwrap())],
    );
    let mut b = driver(
        2,
        port_b,
        vec![(1, format!("127.0.0.1:{port_a}").parse().unwrap())],
    );

    let msg = ModemTransmission {
        src: 1,
        dest: 2,
        kind: TransmissionKind::Data,
        ack_requested: Some(false),
        frames: vec![b"noack".to_vec()],
        ..Default::default()
    };
    a.handle_initiate_transmission(&msg, &mut NullSource).unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut b_got_data = false;
    while Instant::now() < deadline {
        a.do_work(&mut NullSource).unwrap();
        b.do_work(&mut NullSource).unwrap();
        for ev in drain(&mut b) {
            if let DriverEvent::Receive(m) = ev {
                assert_eq!(m.kind, TransmissionKind::Data);
                b_got_data = true;
            }
        }
        for ev in drain(&mut a) {
            assert!(
                !matches!(ev, DriverEvent::Receive(_)),
                "nothing should come back to A"
            );
        }
        if b_got_data {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(b_got_data);
}
