//! Benthos ATM-900 acoustic modem driver (CLAM shell).
//!
//! The ATM-900 presents a command shell where configuration items are
//! `@Name=Value` lines, actions are `AT`-prefixed commands, and received
//! packets are printed as multi-line reports (hex payload when
//! `@PrintHex=Ena`). Unlike Iridium, addressing is done by the modem
//! itself (`@LocalAddr`/`@RemoteAddr`); the payload carries only the
//! transmission kind, the ACK bookkeeping, and the frames, each frame
//! bit-packed and `\r`-delimited inside the packet.
//!
//! Report grammar understood here (`@Prompt=7`, `@Verbose=3`):
//!
//! ```text
//! Receiving,SRC:1,DST:2,SIZE:24      start of a receive report
//! 4845…                              hex continuation lines, SIZE bytes
//! CRC:Pass                           (or CRC:Fail)
//! Range,DST:2,TOA:1.2345             two-way ranging result
//! Lowpower                           entering low-power sleep
//! CONNECT                            online (data) mode entered
//! >                                  shell prompt, back in command mode
//! ```

use log::{debug, warn};

use crate::clock::{Clock, TimePoint};
use crate::consts::{BROADCAST_ID, ModemId};
use crate::protocol::{PacketError, rudics};
use crate::transmission::{DriverSpecific, ModemTransmission, TransmissionKind};

use super::at::AtRing;
use super::{
    DriverConfig, DriverError, DriverEvent, ModemBase, ModemDriver, PayloadSource,
};

/// The modem's broadcast address (ours is 0).
const BENTHOS_BROADCAST_ID: ModemId = 255;

const DEFAULT_RATE: i32 = 2;
const RATE_MIN: i32 = 2;
const RATE_MAX: i32 = 13;

const COMMAND_TIMEOUT_SECONDS: f64 = 2.0;
const RETRIES_BEFORE_RESET: u8 = 10;

#[derive(Debug, Clone)]
pub struct BenthosConfig {
    /// Run `factory_reset` before applying configuration.
    pub factory_reset: bool,
    /// `cfg load <path>` before applying configuration.
    pub config_load: Option<String>,
    /// Extra CLAM configuration lines.
    pub config: Vec<String>,
    pub max_frame_size: u32,
    pub start_timeout: std::time::Duration,
}

impl Default for BenthosConfig {
    fn default() -> Self {
        BenthosConfig {
            factory_reset: false,
            config_load: None,
            config: Vec::new(),
            max_frame_size: 128,
            start_timeout: std::time::Duration::from_secs(30),
        }
    }
}

// ---- wire payload codec ---------------------------------------------
//
// byte 0: kind (2 bits) | ack_requested (1 bit) | acked count (5 bits)
// then acked-frame indices as big-endian u16
// then each frame bit-packed with its own \r terminator

fn serialize_payload(msg: &ModemTransmission) -> Result<Vec<u8>, PacketError> {
    if msg.acked_frames.len() > 31 {
        return Err(PacketError::OutOfRange("acked_frames"));
    }
    let kind = match msg.kind {
        TransmissionKind::Data => 0u8,
        TransmissionKind::Ack => 1,
        TransmissionKind::DriverSpecific => 2,
    };
    let mut out = Vec::new();
    out.push(kind | (u8::from(msg.wants_ack()) << 2) | ((msg.acked_frames.len() as u8) << 3));
    for frame in &msg.acked_frames {
        if *frame > u16::MAX as u32 {
            return Err(PacketError::OutOfRange("acked frame index"));
        }
        out.extend_from_slice(&(*frame as u16).to_be_bytes());
    }
    for frame in &msg.frames {
        if frame.is_empty() {
            break;
        }
        out.extend_from_slice(&rudics::pack(frame));
    }
    Ok(out)
}

fn parse_payload(bytes: &[u8]) -> Result<ModemTransmission, PacketError> {
    let Some((&head, mut rest)) = bytes.split_first() else {
        return Err(PacketError::TooShort { got: 0, need: 1 });
    };
    let mut msg = ModemTransmission {
        kind: match head & 0b11 {
            0 => TransmissionKind::Data,
            1 => TransmissionKind::Ack,
            _ => TransmissionKind::DriverSpecific,
        },
        ack_requested: Some(head & 0b100 != 0),
        ..Default::default()
    };
    let n_acked = (head >> 3) as usize;
    if rest.len() < n_acked * 2 {
        return Err(PacketError::TooShort {
            got: rest.len(),
            need: n_acked * 2,
        });
    }
    for i in 0..n_acked {
        msg.acked_frames
            .push(u16::from_be_bytes([rest[2 * i], rest[2 * i + 1]]) as u32);
    }
    rest = &rest[n_acked * 2..];

    for packed in rest.split_inclusive(|b| *b == b'\r') {
        // ignore stray terminator bytes and trailing line padding
        if packed.len() < 2 || packed.last() != Some(&b'\r') {
            continue;
        }
        msg.frames.push(rudics::unpack(packed)?);
    }
    Ok(msg)
}

// ---- state machine ---------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandState {
    Configure,
    SetClock,
    Ready,
    Dial,
    Range,
    LowPower,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Command(CommandState),
    /// Online (data) mode; transmits then waits for the shell prompt.
    Online { transmitted: bool },
    /// Mid receive-report; returns to `resume` when the report ends.
    ReceiveData {
        resume: Box<State>,
        src: ModemId,
        dest: ModemId,
        size: usize,
        hex: String,
    },
}

#[derive(Debug)]
pub struct BenthosDriver {
    base: ModemBase,
    benthos_cfg: BenthosConfig,
    state: State,
    at_ring: AtRing,
    data_out: std::collections::VecDeque<ModemTransmission>,
    next_frame: u32,
    startup_deadline: Option<TimePoint>,
    /// Outstanding range request, for the completion report.
    ranging_to: Option<ModemId>,
    shutdown: bool,
}

impl BenthosDriver {
    pub fn new(cfg: DriverConfig, benthos_cfg: BenthosConfig, clock: Clock) -> Self {
        BenthosDriver {
            base: ModemBase::new(cfg, clock),
            benthos_cfg,
            state: State::Command(CommandState::Configure),
            at_ring: AtRing::new(),
            data_out: std::collections::VecDeque::new(),
            next_frame: 0,
            startup_deadline: None,
            ranging_to: None,
            shutdown: false,
        }
    }

    fn push_at(&mut self, cmd: &str) {
        if cmd == "+++" {
            self.at_ring.push("+++");
        } else {
            self.at_ring.push(format!("AT{cmd}"));
        }
    }

    fn push_clam(&mut self, cmd: impl Into<String>) {
        self.at_ring.push(cmd.into());
    }

    fn enter_configure(&mut self) {
        debug!("Configure");
        self.state = State::Command(CommandState::Configure);
        self.at_ring.clear();

        // in case we start up in Online mode (@OpMode=1 is the default)
        self.push_at("+++");
        self.push_clam("@OpMode=0");
        self.push_at("");

        // disable local echo to avoid confusing our parser
        self.push_clam("@P1EchoChar=Dis");

        if self.benthos_cfg.factory_reset {
            self.push_clam("factory_reset");
        }
        if let Some(load) = self.benthos_cfg.config_load.clone() {
            self.push_clam(format!("cfg load {load}"));
        }
        for item in self.benthos_cfg.config.clone() {
            self.push_clam(item);
        }

        // ensure serial output is the format we expect
        self.push_clam("@Prompt=7");
        self.push_clam("@Verbose=3");
        // retries are handled here, not in the modem
        self.push_clam("@DataRetry=0");
        // send the data immediately after we post it
        self.push_clam("@FwdDelay=0.05");
        let local = self.base.cfg().modem_id;
        self.push_clam(format!("@LocalAddr={local}"));
        // hex format for data
        self.push_clam("@PrintHex=Ena");
        // wake tones so the modem resumes from low power at packet receipt
        self.push_clam("@WakeTones=Ena");
        // receive everything; discarding is our job
        self.push_clam("@RcvAll=Ena");
        // show data for bad packets so we can keep statistics
        self.push_clam("@ShowBadData=Ena");
        // start up in command mode after reboot/low-power resume
        self.push_clam("@OpMode=0");
    }

    fn enter_set_clock(&mut self) {
        debug!("SetClock");
        self.state = State::Command(CommandState::SetClock);
        let now = self.base.clock().now().to_datetime();
        self.push_clam(format!(
            "date -t{} -d{}",
            now.format("%H:%M:%S"),
            now.format("%m/%d/%Y")
        ));
    }

    fn enter_ready(&mut self) {
        debug!("Ready");
        self.state = State::Command(CommandState::Ready);
    }

    fn enter_dial(&mut self, dest: ModemId, rate: i32) {
        debug!("Dial");
        self.state = State::Command(CommandState::Dial);
        let dest = if dest == BROADCAST_ID {
            BENTHOS_BROADCAST_ID
        } else {
            dest
        };
        let rate = if (RATE_MIN..=RATE_MAX).contains(&rate) {
            rate
        } else {
            DEFAULT_RATE
        };
        self.push_clam(format!("@RemoteAddr={dest}"));
        self.push_clam(format!("@TxRate={rate}"));
        self.push_at("O");
    }

    fn enter_range(&mut self, dest: ModemId) {
        debug!("Range");
        self.state = State::Command(CommandState::Range);
        self.ranging_to = Some(dest);
        self.push_at(&format!("R{dest}"));
    }

    fn handle_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw).trim().to_string();

        // a receive report may interrupt any state
        if let Some(rest) = line.strip_prefix("Receiving,") {
            self.begin_receive(rest);
            return;
        }

        match std::mem::replace(&mut self.state, State::Command(CommandState::Ready)) {
            State::ReceiveData {
                resume,
                src,
                dest,
                size,
                mut hex,
            } => {
                if let Some(result) = line.strip_prefix("CRC:") {
                    self.state = *resume;
                    if result == "Pass" {
                        self.finish_receive(src, dest, &hex);
                    } else {
                        warn!("dropping packet with failed CRC from {src}");
                    }
                } else {
                    hex.push_str(&line);
                    self.state = State::ReceiveData {
                        resume,
                        src,
                        dest,
                        size,
                        hex,
                    };
                }
                return;
            }
            other => self.state = other,
        }

        match line.as_str() {
            "OK" => self.handle_ack(),
            "ERROR" | "Error" => {
                warn!("modem reported an error, resetting");
                self.enter_configure();
            }
            "CONNECT" => {
                // ignore a CONNECT seen while escaping with +++
                if self.at_ring.head_body() != Some("+++") {
                    debug!("Online");
                    self.at_ring.clear();
                    self.state = State::Online { transmitted: false };
                }
            }
            "Lowpower" => {
                debug!("LowPower");
                self.state = State::Command(CommandState::LowPower);
            }
            ">" => {
                // shell prompt: back in command mode
                if matches!(self.state, State::Online { .. }) {
                    self.enter_ready();
                }
            }
            _ if line.starts_with("Range,") => self.handle_range_report(&line),
            _ if line.is_empty() => {}
            _ => debug!("unhandled line: {line}"),
        }
    }

    fn begin_receive(&mut self, rest: &str) {
        let mut src = BENTHOS_BROADCAST_ID;
        let mut dest = BENTHOS_BROADCAST_ID;
        let mut size = 0usize;
        for field in rest.split(',') {
            match field.split_once(':') {
                Some(("SRC", v)) => src = v.parse().unwrap_or(src),
                Some(("DST", v)) => dest = v.parse().unwrap_or(dest),
                Some(("SIZE", v)) => size = v.parse().unwrap_or(0),
                _ => {}
            }
        }
        debug!("receiving {size} bytes from {src}");
        let resume = std::mem::replace(&mut self.state, State::Command(CommandState::Ready));
        self.state = State::ReceiveData {
            resume: Box::new(resume),
            src,
            dest,
            size,
            hex: String::new(),
        };
    }

    fn finish_receive(&mut self, src: ModemId, dest: ModemId, hex_data: &str) {
        let Ok(bytes) = hex::decode(hex_data) else {
            warn!("undecodable hex in receive report");
            return;
        };
        match parse_payload(&bytes) {
            Ok(mut msg) => {
                msg.src = src;
                msg.dest = if dest == BENTHOS_BROADCAST_ID {
                    BROADCAST_ID
                } else {
                    dest
                };
                msg.time = Some(self.base.clock().now());
                msg.frame_start = Some(self.next_frame);

                if msg.kind == TransmissionKind::Data
                    && msg.wants_ack()
                    && msg.dest == self.base.cfg().modem_id
                {
                    let mut ack = ModemTransmission::ack_of(&msg);
                    ack.time = msg.time;
                    self.data_out.push_back(ack.clone());
                    self.dial_for(&ack);
                }
                self.base.push_event(DriverEvent::Receive(msg));
            }
            Err(e) => warn!("could not parse received packet: {e}"),
        }
    }

    fn handle_range_report(&mut self, line: &str) {
        // Range,DST:2,TOA:1.2345
        debug!("ranging complete: {line}");
        if let Some(dest) = self.ranging_to.take() {
            let msg = ModemTransmission {
                src: self.base.cfg().modem_id,
                dest,
                kind: TransmissionKind::DriverSpecific,
                driver_specific: Some(DriverSpecific::BenthosRange { dest }),
                time: Some(self.base.clock().now()),
                ..Default::default()
            };
            self.base.push_event(DriverEvent::TransmitResult(msg));
        }
        if self.state == State::Command(CommandState::Range) {
            self.enter_ready();
        }
    }

    fn handle_ack(&mut self) {
        if self.at_ring.is_empty() {
            debug!("unexpected OK");
            return;
        }
        let _ = self.at_ring.pop_front();
        if self.at_ring.is_empty() {
            match self.state {
                State::Command(CommandState::Configure) => self.enter_set_clock(),
                State::Command(CommandState::SetClock) => self.enter_ready(),
                _ => {}
            }
        }
    }

    fn command_tx(&mut self) -> Result<(), DriverError> {
        let now = self.base.clock().now().unix_seconds_f64();
        let Some(head) = self.at_ring.front() else {
            return Ok(());
        };
        let due = head
            .last_send_time
            .is_none_or(|t| t.unix_seconds_f64() + COMMAND_TIMEOUT_SECONDS < now);
        if !due {
            return Ok(());
        }

        // unlike Hayes modems, the CLAM shell takes its escape as an
        // ordinary line, so every sentence gets the terminator
        let wire = format!("{}\r\n", head.body).into_bytes();

        let reset = {
            let head = match self.at_ring.front_mut() {
                Some(h) => h,
                None => return Ok(()),
            };
            head.tries += 1;
            head.tries > RETRIES_BEFORE_RESET
        };
        if reset {
            warn!("no response after {RETRIES_BEFORE_RESET} tries, resetting");
            self.enter_configure();
            return Ok(());
        }
        if let Some(head) = self.at_ring.front_mut() {
            head.last_send_time = Some(self.base.clock().now());
        }
        self.base.modem_write(&wire)
    }

    fn online_tx(&mut self) -> Result<(), DriverError> {
        if let State::Online { transmitted } = self.state {
            if !transmitted {
                if let Some(msg) = self.data_out.pop_front() {
                    match serialize_payload(&msg) {
                        Ok(mut bytes) => {
                            // terminate so the forwarding delay fires
                            bytes.extend_from_slice(b"\r\n");
                            self.base.modem_write(&bytes)?;
                            self.base.push_event(DriverEvent::TransmitResult(msg));
                        }
                        Err(e) => warn!("cannot serialize payload: {e}"),
                    }
                    self.state = State::Online { transmitted: true };
                }
            }
        }
        Ok(())
    }

    fn dial_for(&mut self, msg: &ModemTransmission) {
        if matches!(self.state, State::Command(CommandState::Ready)) {
            self.enter_dial(msg.dest, msg.rate);
        }
    }

    /// Ask the modem to sleep until the next wake tone.
    pub fn request_low_power(&mut self) {
        if matches!(self.state, State::Command(CommandState::Ready)) {
            self.push_at("L");
        }
    }

    /// Two-way acoustic range to `dest`.
    pub fn range(&mut self, dest: ModemId) {
        if matches!(self.state, State::Command(CommandState::Ready)) {
            self.enter_range(dest);
        }
    }
}

impl ModemDriver for BenthosDriver {
    fn startup(&mut self) -> Result<(), DriverError> {
        debug!("Benthos ATM-900 driver starting up");
        self.shutdown = false;
        self.base.modem_start()?;
        self.enter_configure();
        self.startup_deadline =
            Some(self.base.clock().now() + self.benthos_cfg.start_timeout);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutdown = true;
        self.base.modem_close();
    }

    fn do_work(&mut self, _source: &mut dyn PayloadSource) -> Result<(), DriverError> {
        if self.shutdown {
            return Ok(());
        }

        if let Some(deadline) = self.startup_deadline {
            if matches!(
                self.state,
                State::Command(CommandState::Ready) | State::Command(CommandState::LowPower)
            ) {
                self.startup_deadline = None;
            } else if self.base.clock().now() > deadline {
                self.startup_deadline = None;
                return Err(DriverError::NotResponding(
                    "modem did not reach Ready within the start timeout".into(),
                ));
            }
        }

        while let Some(line) = self.base.modem_read() {
            self.handle_line(&line);
        }

        self.command_tx()?;
        self.online_tx()
    }

    fn handle_initiate_transmission(
        &mut self,
        orig: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError> {
        if orig.kind == TransmissionKind::DriverSpecific {
            if let Some(DriverSpecific::BenthosRange { dest }) = orig.driver_specific {
                self.range(dest);
                return Ok(());
            }
        }

        let mut msg = orig.clone();
        source.modify_transmission(&mut msg);

        if msg.frame_start.is_none() {
            msg.frame_start = Some(self.next_frame);
        }
        let max = self.benthos_cfg.max_frame_size;
        if msg.max_frame_bytes.is_none_or(|b| b > max) {
            msg.max_frame_bytes = Some(max);
        }
        source.data_request(&mut msg);
        self.next_frame += msg.frames.len() as u32;

        if !msg.frames_empty() {
            self.data_out.push_back(msg.clone());
            self.dial_for(&msg);
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.base.poll_event()
    }

    fn report(&self) -> crate::transmission::ModemReport {
        self.base.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NullSource;
    use crate::line_io::{LineIo, LineIoConfig, MemEndpoint};
    use std::time::Duration;

    #[test]
    fn payload_codec_round_trips() {
        let msg = ModemTransmission {
            kind: TransmissionKind::Data,
            ack_requested: Some(true),
            frames: vec![b"alpha\rbeta".to_vec(), b"\x00\xff".to_vec()],
            ..Default::default()
        };
        let bytes = serialize_payload(&msg).unwrap();
        let parsed = parse_payload(&bytes).unwrap();
        assert_eq!(parsed.kind, TransmissionKind::Data);
        assert_eq!(parsed.ack_requested, Some(true));
        assert_eq!(parsed.frames, msg.frames);

        let ack = ModemTransmission {
            kind: TransmissionKind::Ack,
            acked_frames: vec![3, 4, 5],
            ..Default::default()
        };
        let parsed = parse_payload(&serialize_payload(&ack).unwrap()).unwrap();
        assert_eq!(parsed.kind, TransmissionKind::Ack);
        assert_eq!(parsed.acked_frames, vec![3, 4, 5]);
    }

    fn driver() -> (BenthosDriver, MemEndpoint, Clock) {
        let (ours, theirs) = MemEndpoint::pair(b"\r\n");
        let clock = Clock::simulated(TimePoint::from_unix_seconds(1_000_000));
        let cfg = DriverConfig {
            modem_id: 1,
            connection: LineIoConfig::Mem(ours),
            line_delimiter: b"\r\n".to_vec(),
        };
        let mut d = BenthosDriver::new(cfg, BenthosConfig::default(), clock.clone());
        d.startup().unwrap();
        (d, theirs, clock)
    }

    fn ack_until_ready(driver: &mut BenthosDriver, wire: &mut MemEndpoint, clock: &Clock) {
        for _ in 0..64 {
            clock.advance(Duration::from_secs(3));
            driver.do_work(&mut NullSource).unwrap();
            while wire.read().is_ok() {
                wire.write(b"OK\r\n").unwrap();
            }
            driver.do_work(&mut NullSource).unwrap();
            if matches!(driver.state, State::Command(CommandState::Ready)) {
                return;
            }
        }
        panic!("never reached Ready");
    }

    #[test]
    fn configure_pushes_clam_setup_then_clock() {
        let (mut driver, mut wire, clock) = driver();
        wire.start().unwrap();

        clock.advance(Duration::from_secs(3));
        driver.do_work(&mut NullSource).unwrap();
        assert_eq!(wire.read().unwrap(), b"+++\r\n".to_vec());

        ack_until_ready(&mut driver, &mut wire, &clock);
    }

    #[test]
    fn transmission_dials_and_streams() {
        let (mut driver, mut wire, clock) = driver();
        wire.start().unwrap();
        ack_until_ready(&mut driver, &mut wire, &clock);

        let msg = ModemTransmission {
            src: 1,
            dest: 2,
            rate: 4,
            kind: TransmissionKind::Data,
            frames: vec![b"acoustic".to_vec()],
            ..Default::default()
        };
        driver
            .handle_initiate_transmission(&msg, &mut NullSource)
            .unwrap();

        // @RemoteAddr, @TxRate, ATO
        let mut sent = Vec::new();
        for _ in 0..6 {
            clock.advance(Duration::from_secs(3));
            driver.do_work(&mut NullSource).unwrap();
            while let Ok(line) = wire.read() {
                sent.push(String::from_utf8_lossy(&line).trim().to_string());
                wire.write(b"OK\r\n").unwrap();
            }
        }
        assert!(sent.contains(&"@RemoteAddr=2".to_string()), "{sent:?}");
        assert!(sent.contains(&"@TxRate=4".to_string()), "{sent:?}");
        assert!(sent.contains(&"ATO".to_string()), "{sent:?}");

        // modem goes online; the payload streams out
        wire.write(b"CONNECT\r\n").unwrap();
        driver.do_work(&mut NullSource).unwrap();
        driver.do_work(&mut NullSource).unwrap();
        let payload = wire.read().unwrap();
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.frames, vec![b"acoustic".to_vec()]);

        // prompt: back to command mode
        wire.write(b">\r\n").unwrap();
        driver.do_work(&mut NullSource).unwrap();
        assert!(matches!(
            driver.state,
            State::Command(CommandState::Ready)
        ));
    }

    #[test]
    fn receive_report_parses_and_acks() {
        let (mut driver, mut wire, clock) = driver();
        wire.start().unwrap();
        ack_until_ready(&mut driver, &mut wire, &clock);

        let inbound = ModemTransmission {
            kind: TransmissionKind::Data,
            ack_requested: Some(true),
            frames: vec![b"under the sea".to_vec()],
            ..Default::default()
        };
        let bytes = serialize_payload(&inbound).unwrap();
        let report = format!(
            "Receiving,SRC:2,DST:1,SIZE:{}\r\n{}\r\nCRC:Pass\r\n",
            bytes.len(),
            hex::encode(&bytes)
        );
        wire.write(report.as_bytes()).unwrap();
        driver.do_work(&mut NullSource).unwrap();

        let mut received = Vec::new();
        while let Some(ev) = driver.poll_event() {
            if let DriverEvent::Receive(m) = ev {
                received.push(m);
            }
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].src, 2);
        assert_eq!(received[0].frames, vec![b"under the sea".to_vec()]);

        // the ack dials back to the sender
        let mut sent = Vec::new();
        for _ in 0..4 {
            clock.advance(Duration::from_secs(3));
            driver.do_work(&mut NullSource).unwrap();
            while let Ok(line) = wire.read() {
                sent.push(String::from_utf8_lossy(&line).trim().to_string());
                wire.write(b"OK\r\n").unwrap();
            }
        }
        assert!(sent.contains(&"@RemoteAddr=2".to_string()), "{sent:?}");
    }

    #[test]
    fn crc_fail_drops_the_packet() {
        let (mut driver, mut wire, clock) = driver();
        wire.start().unwrap();
        ack_until_ready(&mut driver, &mut wire, &clock);

        wire.write(b"Receiving,SRC:2,DST:1,SIZE:4\r\ndeadbeef\r\nCRC:Fail\r\n")
            .unwrap();
        driver.do_work(&mut NullSource).unwrap();
        while let Some(ev) = driver.poll_event() {
            assert!(
                !matches!(ev, DriverEvent::Receive(_)),
                "failed CRC must not deliver"
            );
        }
    }
}
