//! Store-and-forward client against a minimal in-test server.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::time::Duration;

use acomms::clock::{Clock, TimePoint};
use acomms::driver::store_client::{
    StoreClientConfig, StoreClientDriver, StoreServerRequest, StoreServerResponse,
    parse_store_server_message, serialize_store_server_message,
};
use acomms::driver::{DriverConfig, DriverEvent, ModemDriver, NullSource};
use acomms::line_io::LineIoConfig;
use acomms::transmission::{ModemTransmission, TransmissionKind};

/// A single-connection store server with a fixed inbox for modem 1.
struct TestServer {
    listener: TcpListener,
    client: Option<std::net::TcpStream>,
    buf: Vec<u8>,
    stored: Vec<ModemTransmission>,
    requests_seen: Vec<StoreServerRequest>,
}

impl TestServer {
    fn new(stored: Vec<ModemTransmission>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        TestServer {
            listener,
            client: None,
            buf: Vec::new(),
            stored,
            requests_seen: Vec::new(),
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    fn do_work(&mut self) {
        if self.client.is_none() {
            if let Ok((stream, _)) = self.listener.accept() {
                stream.set_nonblocking(true).unwrap();
                self.client = Some(stream);
            }
        }
        let Some(stream) = self.client.as_mut() else {
            return;
        };

        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.client = None;
                    return;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.client = None;
                    return;
                }
            }
        }

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\r') {
            let packet: Vec<u8> = self.buf.drain(..=pos).collect();
            let request: StoreServerRequest = parse_store_server_message(&packet).unwrap();
            let response = StoreServerResponse {
                modem_id: 0,
                request_id: request.request_id,
                inbox: std::mem::take(&mut self.stored),
            };
            self.requests_seen.push(request);
            let bytes = serialize_store_server_message(&response).unwrap();
            if let Some(stream) = self.client.as_mut() {
                stream.write_all(&bytes).unwrap();
            }
        }
    }
}

fn client(port: u16, clock: Clock) -> StoreClientDriver {
    let cfg = DriverConfig {
        modem_id: 1,
        connection: LineIoConfig::TcpClient {
            host: "127.0.0.1".into(),
            port,
        },
        line_delimiter: b"\r".to_vec(),
    };
    StoreClientDriver::new(
        cfg,
        StoreClientConfig {
            query_interval: Duration::from_secs(1),
            reset_interval: Duration::from_secs(120),
            ..Default::default()
        },
        clock,
    )
}

#[test]
fn stored_message_is_delivered_within_two_polls() {
    let stored = ModemTransmission {
        src: 2,
        dest: 1,
        kind: TransmissionKind::Data,
        frames: vec![b"from-the-store".to_vec()],
        ..Default::default()
    };
    let mut server = TestServer::new(vec![stored.clone()]);
    let clock = Clock::simulated(TimePoint::from_unix_seconds(100));
    let mut driver = client(server.port(), clock.clone());
    driver.startup().unwrap();

    let mut received = Vec::new();
    // two query intervals, ticked in 100 ms steps
    for _ in 0..20 {
        clock.advance(Duration::from_millis(100));
        driver.do_work(&mut NullSource).unwrap();
        server.do_work();
        // give the TCP stack a moment to move bytes
        std::thread::sleep(Duration::from_millis(5));
        driver.do_work(&mut NullSource).unwrap();
        while let Some(ev) = driver.poll_event() {
            if let DriverEvent::Receive(m) = ev {
                received.push(m);
            }
        }
        if !received.is_empty() {
            break;
        }
    }

    assert_eq!(received.len(), 1);
    assert_eq!(received[0].frames, vec![b"from-the-store".to_vec()]);
    assert!(
        !server.requests_seen.is_empty(),
        "client polled with an empty outbox"
    );
    assert!(server.requests_seen[0].outbox.is_empty());
    assert_eq!(server.requests_seen[0].modem_id, 1);
}

#[test]
fn outbox_rides_the_next_poll_and_acks_come_back() {
    let mut server = TestServer::new(Vec::new());
    let clock = Clock::simulated(TimePoint::from_unix_seconds(100));
    let mut driver = client(server.port(), clock.clone());
    driver.startup().unwrap();

    // our own slot with preloaded data
    let msg = ModemTransmission {
        src: 1,
        dest: 2,
        kind: TransmissionKind::Data,
        frames: vec![b"outbound".to_vec()],
        ..Default::default()
    };
    driver.handle_initiate_transmission(&msg, &mut NullSource).unwrap();

    for _ in 0..20 {
        clock.advance(Duration::from_millis(200));
        driver.do_work(&mut NullSource).unwrap();
        server.do_work();
        std::thread::sleep(Duration::from_millis(5));
        if !server.requests_seen.is_empty() {
            break;
        }
    }

    let request = &server.requests_seen[0];
    assert_eq!(request.outbox.len(), 1);
    assert_eq!(request.outbox[0].frames, vec![b"outbound".to_vec()]);
    assert_eq!(request.outbox[0].frame_start, Some(0));
}
