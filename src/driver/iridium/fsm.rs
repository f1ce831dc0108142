//! The Iridium driver state machine.
//!
//! Three orthogonal pieces of state evolve together:
//!
//! * [`LineState`] — whether the DTE is in AT command mode or online in a
//!   data-mode (RUDICS) session, with the command-mode substate;
//! * [`CallState`] — whether a circuit-switched call is up;
//! * [`SbdState`] — progress of the current Short Burst Data session
//!   (only meaningful while in command mode).
//!
//! Every transition is a pure function of `(state, event)` in
//! [`IridiumFsm::handle`]; side effects are confined to the buffers the
//! FSM owns (the AT ring, the serial tx queue, `received`, `data_out`).

use heapless::Deque;
use log::{debug, warn};

use crate::clock::{Clock, TimePoint};
use crate::driver::at::AtRing;
use crate::protocol::{header, rudics, sbd};
use crate::transmission::ModemTransmission;

/// Abstract rate code for a single-packet SBD session.
pub const RATE_SBD: i32 = 0;
/// Abstract rate code for a streaming RUDICS session.
pub const RATE_RUDICS: i32 = 1;

const SERIAL_BUFFER_CAPACITY: usize = 10;
const RECEIVED_BUFFER_CAPACITY: usize = 10;
const DATA_BUFFER_CAPACITY: usize = 5;

const COMMAND_TIMEOUT_SECONDS: f64 = 2.0;
const DIAL_TIMEOUT_SECONDS: f64 = 60.0;
const SBDIX_TIMEOUT_SECONDS: f64 = DIAL_TIMEOUT_SECONDS;
const TRIPLE_PLUS_TIMEOUT_SECONDS: f64 = 6.0;
const HANGUP_TIMEOUT_SECONDS: f64 = 10.0;
const ANSWER_TIMEOUT_SECONDS: f64 = 30.0;
const RETRIES_BEFORE_RESET: u8 = 3;
const REDIAL_WAIT_SECONDS: f64 = 2.0;

/// Events fed to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    /// One line (or binary fragment) from the modem.
    RxLine(Vec<u8>),
    /// Pump the AT ring / on-call data; posted every driver tick.
    TxTick,
    /// A response that completes the head AT sentence.
    Ack(String),
    /// The AT ring drained.
    AtEmpty,
    /// Protocol error; pop back to the top of the machine.
    Reset,
    Dial,
    Ring,
    Online,
    Hangup,
    Connect,
    NoCarrier,
    Disconnect,
    SendBye,
    /// Begin an SBD session (empty payload = mailbox check).
    SbdBeginData { payload: Vec<u8>, ring_alert: bool },
    SbdSendBufferCleared,
    SbdWriteReady,
    SbdWriteComplete,
    /// The raw `+SBDI…` 6-tuple line.
    SbdTransmitComplete(String),
    SbdReceiveComplete,
}

/// Command-mode substate (region 0 while not online).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Configure,
    Ready,
    Dial,
    Answer,
    HangingUp,
    PostDisconnected,
}

/// Region 0: AT command mode vs. data mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Command(CommandState),
    Online,
}

/// Region 1: call liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    NotOnCall,
    OnCall,
}

/// SBD session progress (command mode only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbdState {
    Ready,
    ClearBuffers,
    Write,
    Transmit,
    Receive,
}

/// Liveness bookkeeping for the current (or last) call.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnCallStats {
    pub last_tx_time: f64,
    pub last_rx_time: f64,
    pub bye_sent: bool,
    pub bye_received: bool,
    pub last_bytes_sent: usize,
    pub total_bytes_sent: usize,
}

impl OnCallStats {
    pub fn last_rx_tx_time(&self) -> f64 {
        self.last_tx_time.max(self.last_rx_time)
    }
}

/// Signal quality gleaned from unsolicited `+CIEV` reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct CievData {
    pub rssi: Option<i32>,
    pub service_available: Option<bool>,
}

/// Static settings the FSM needs; a trimmed view of the driver config.
#[derive(Debug, Clone)]
pub struct FsmConfig {
    /// Extra AT sentences pushed during `Configure`.
    pub config: Vec<String>,
    /// Number dialed for a RUDICS session.
    pub remote_number: Option<String>,
    pub dial_attempts: u8,
    pub target_bit_rate: u32,
}

impl Default for FsmConfig {
    fn default() -> Self {
        FsmConfig {
            config: Vec::new(),
            remote_number: None,
            dial_attempts: 3,
            target_bit_rate: 2400,
        }
    }
}

#[derive(Debug)]
pub struct IridiumFsm {
    clock: Clock,
    cfg: FsmConfig,

    pub line: LineState,
    pub call: CallState,
    pub sbd: SbdState,

    at_ring: AtRing,
    /// Lines/bytes queued for the wire; the driver drains this.
    serial_tx: Deque<Vec<u8>, SERIAL_BUFFER_CAPACITY>,
    /// Decoded inbound transmissions; the driver drains this.
    received: Deque<ModemTransmission, RECEIVED_BUFFER_CAPACITY>,
    /// Outbound transmissions awaiting a RUDICS call.
    data_out: Deque<ModemTransmission, DATA_BUFFER_CAPACITY>,

    sbd_rx: sbd::SbdReadBuffer,
    sbd_payload: Vec<u8>,
    sbd_ring_alert: bool,

    dial_attempts_made: u8,
    redial_at: Option<TimePoint>,

    pub on_call: OnCallStats,
    pub ciev: CievData,

    /// Events posted from within a transition, processed before new input.
    pending: std::collections::VecDeque<Ev>,
}

impl IridiumFsm {
    pub fn new(cfg: FsmConfig, clock: Clock) -> Self {
        IridiumFsm {
            clock,
            cfg,
            line: LineState::Command(CommandState::Configure),
            call: CallState::NotOnCall,
            sbd: SbdState::Ready,
            at_ring: AtRing::new(),
            serial_tx: Deque::new(),
            received: Deque::new(),
            data_out: Deque::new(),
            sbd_rx: sbd::SbdReadBuffer::new(),
            sbd_payload: Vec::new(),
            sbd_ring_alert: false,
            dial_attempts_made: 0,
            redial_at: None,
            on_call: OnCallStats::default(),
            ciev: CievData::default(),
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Enter the initial state and push the configuration dialog.
    pub fn initiate(&mut self) {
        self.enter_configure();
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.line, LineState::Command(CommandState::Ready))
    }

    pub fn is_on_call(&self) -> bool {
        self.call == CallState::OnCall
    }

    /// Queue a transmission for the RUDICS stream.
    pub fn buffer_data_out(&mut self, msg: ModemTransmission) {
        if self.data_out.is_full() {
            let _ = self.data_out.pop_front();
        }
        let _ = self.data_out.push_back(msg);
    }

    pub fn data_out_empty(&self) -> bool {
        self.data_out.is_empty()
    }

    /// Next chunk of bytes for the wire.
    pub fn pop_serial_tx(&mut self) -> Option<Vec<u8>> {
        self.serial_tx.pop_front()
    }

    /// Next decoded inbound transmission.
    pub fn pop_received(&mut self) -> Option<ModemTransmission> {
        self.received.pop_front()
    }

    fn push_serial(&mut self, bytes: Vec<u8>) {
        if self.serial_tx.is_full() {
            let _ = self.serial_tx.pop_front();
        }
        let _ = self.serial_tx.push_back(bytes);
    }

    fn push_serial_front(&mut self, bytes: Vec<u8>) {
        if self.serial_tx.is_full() {
            let _ = self.serial_tx.pop_back();
        }
        let _ = self.serial_tx.push_front(bytes);
    }

    fn push_received(&mut self, msg: ModemTransmission) {
        if self.received.is_full() {
            let _ = self.received.pop_front();
        }
        let _ = self.received.push_back(msg);
    }

    fn post(&mut self, ev: Ev) {
        self.pending.push_back(ev);
    }

    /// Feed one event through the machine, following any internally
    /// posted events to quiescence.
    pub fn process(&mut self, ev: Ev) {
        self.pending.push_back(ev);
        // bounded: internal cascades are short, but don't trust that
        let mut steps = 0;
        while let Some(ev) = self.pending.pop_front() {
            self.handle(ev);
            steps += 1;
            if steps > 64 {
                warn!("event cascade too deep; dropping remainder");
                self.pending.clear();
                break;
            }
        }
    }

    // ---- state entries ----------------------------------------------

    fn enter_configure(&mut self) {
        debug!("Configure");
        self.line = LineState::Command(CommandState::Configure);
        self.at_ring.clear();
        self.at_ring.push("");
        for item in self.cfg.config.clone() {
            self.at_ring.push(item);
        }
    }

    fn enter_ready(&mut self) {
        debug!("Ready");
        self.line = LineState::Command(CommandState::Ready);
    }

    fn enter_dial(&mut self) {
        debug!("Dial");
        self.line = LineState::Command(CommandState::Dial);
        self.dial_attempts_made = 0;
        self.redial_at = None;
        self.dial();
    }

    fn dial(&mut self) {
        self.dial_attempts_made += 1;
        let number = self.cfg.remote_number.clone().unwrap_or_default();
        self.at_ring.push(format!("D{number}"));
    }

    fn enter_answer(&mut self) {
        debug!("Answer");
        self.line = LineState::Command(CommandState::Answer);
        self.at_ring.push("A");
    }

    fn enter_hanging_up(&mut self) {
        debug!("HangingUp");
        self.line = LineState::Command(CommandState::HangingUp);
        self.at_ring.push("+++");
        self.at_ring.push("H");
    }

    fn enter_post_disconnected(&mut self) {
        debug!("PostDisconnected; checking error details");
        self.line = LineState::Command(CommandState::PostDisconnected);
        self.at_ring.push("+CEER");
    }

    fn enter_on_call(&mut self) {
        debug!("OnCall");
        self.call = CallState::OnCall;
        self.on_call = OnCallStats {
            last_tx_time: self.now_seconds(),
            ..OnCallStats::default()
        };
        // brief identifier, *different* from the "~" PPP would send, and
        // a leading \r to flush any line noise at the remote parser
        self.push_serial_front(b"goby\r".to_vec());
        self.post(Ev::Online);
    }

    fn leave_on_call(&mut self) {
        debug!(
            "sent {} bytes on this call",
            self.on_call.total_bytes_sent
        );
        self.call = CallState::NotOnCall;
        self.post(Ev::Disconnect);
    }

    fn enter_sbd_clear_buffers(&mut self) {
        debug!("SBDClearBuffers");
        self.sbd = SbdState::ClearBuffers;
        self.sbd_rx.clear();
        self.at_ring.push("+SBDD2");
    }

    fn enter_sbd_write(&mut self) {
        self.sbd = SbdState::Write;
        if self.sbd_payload.is_empty() {
            debug!("SBDWrite: mailbox check");
            self.post(Ev::SbdWriteComplete);
        } else {
            debug!("SBDWrite: writing data");
            self.at_ring
                .push(format!("+SBDWB={}", self.sbd_payload.len()));
        }
    }

    fn enter_sbd_transmit(&mut self) {
        debug!("SBDTransmit");
        self.sbd = SbdState::Transmit;
        if self.sbd_ring_alert {
            self.at_ring.push("+SBDIXA");
        } else {
            self.at_ring.push("+SBDIX");
        }
    }

    fn enter_sbd_receive(&mut self) {
        debug!("SBDReceive");
        self.sbd = SbdState::Receive;
        self.at_ring.push("+SBDRB");
    }

    // ---- helpers ----------------------------------------------------

    fn now_seconds(&self) -> f64 {
        self.clock.now().unix_seconds_f64()
    }

    fn command_timeout(body: &str) -> f64 {
        if body.starts_with("+SBDI") {
            return SBDIX_TIMEOUT_SECONDS;
        }
        match body.as_bytes().first().copied() {
            Some(b'D') => DIAL_TIMEOUT_SECONDS,
            Some(b'A') => ANSWER_TIMEOUT_SECONDS,
            Some(b'H') => HANGUP_TIMEOUT_SECONDS,
            Some(b'+') if body == "+++" => TRIPLE_PLUS_TIMEOUT_SECONDS,
            _ => COMMAND_TIMEOUT_SECONDS,
        }
    }

    fn parse_ciev(&mut self, line: &str) {
        // +CIEV:0,N (signal quality 0-5) or +CIEV:1,M (service availability)
        let Some(rest) = line.find(':').map(|p| &line[p + 1..]) else {
            debug!("invalid +CIEV: {line}");
            return;
        };
        let mut parts = rest.split(',').map(str::trim);
        let (Some(mode), Some(value)) = (
            parts.next().and_then(|v| v.parse::<i32>().ok()),
            parts.next().and_then(|v| v.parse::<i32>().ok()),
        ) else {
            debug!("invalid +CIEV: could not convert integers: {line}");
            return;
        };
        match mode {
            0 => self.ciev.rssi = Some(value),
            1 => self.ciev.service_available = Some(value == 1),
            _ => debug!("unhandled +CIEV mode {mode}"),
        }
    }

    // ---- the transition function ------------------------------------

    fn handle(&mut self, ev: Ev) {
        match ev {
            Ev::RxLine(line) => self.handle_rx_line(line),
            Ev::TxTick => self.handle_tx_tick(),
            Ev::Ack(response) => self.handle_ack(&response),
            Ev::AtEmpty => match self.line {
                LineState::Command(CommandState::Configure)
                | LineState::Command(CommandState::HangingUp)
                | LineState::Command(CommandState::PostDisconnected) => self.enter_ready(),
                _ => {}
            },
            Ev::Reset => {
                self.sbd = SbdState::Ready;
                self.sbd_payload.clear();
                self.sbd_rx.clear();
                self.call = CallState::NotOnCall;
                self.enter_configure();
            }
            Ev::Dial => {
                if self.line == LineState::Command(CommandState::Ready) {
                    if self.call == CallState::NotOnCall {
                        self.enter_dial();
                    } else {
                        debug!("not dialing since we are already on a call");
                    }
                }
            }
            Ev::Ring => {
                if self.line == LineState::Command(CommandState::Ready) {
                    self.enter_answer();
                }
            }
            Ev::Online => {
                if matches!(self.line, LineState::Command(_)) {
                    debug!("Online");
                    self.line = LineState::Online;
                }
            }
            Ev::Hangup => {
                if self.line == LineState::Online {
                    self.enter_hanging_up();
                }
            }
            Ev::Connect => {
                if self.call == CallState::NotOnCall {
                    self.enter_on_call();
                }
            }
            Ev::NoCarrier => self.handle_no_carrier(),
            Ev::Disconnect => {
                if self.line == LineState::Online {
                    self.enter_post_disconnected();
                }
            }
            Ev::SendBye => {
                if self.call == CallState::OnCall {
                    self.push_serial_front(b"bye\r".to_vec());
                    self.on_call.bye_sent = true;
                }
            }
            Ev::SbdBeginData {
                payload,
                ring_alert,
            } => {
                // only a fresh session may latch the ring-alert flag; an
                // in-progress MO keeps its +SBDIX
                if self.sbd == SbdState::Ready && matches!(self.line, LineState::Command(_)) {
                    self.sbd_payload = payload;
                    self.sbd_ring_alert = ring_alert;
                    self.enter_sbd_clear_buffers();
                } else {
                    debug!("SBD session already in progress; ignoring begin-data");
                }
            }
            Ev::SbdSendBufferCleared => {
                if self.sbd == SbdState::ClearBuffers {
                    self.enter_sbd_write();
                }
            }
            Ev::SbdWriteReady => {
                if self.sbd == SbdState::Write && !self.sbd_payload.is_empty() {
                    let framed = sbd::append_checksum(&self.sbd_payload);
                    self.push_serial(framed);
                }
            }
            Ev::SbdWriteComplete => {
                if self.sbd == SbdState::Write {
                    self.enter_sbd_transmit();
                }
            }
            Ev::SbdTransmitComplete(sbdi) => {
                if self.sbd == SbdState::Transmit {
                    self.handle_sbdi(&sbdi);
                }
            }
            Ev::SbdReceiveComplete => {
                if self.sbd == SbdState::Receive {
                    self.sbd = SbdState::Ready;
                }
            }
        }
    }

    fn handle_rx_line(&mut self, raw: Vec<u8>) {
        match self.line {
            LineState::Online => self.on_call_rx(&raw),
            LineState::Command(_) => self.command_rx(raw),
        }
    }

    fn command_rx(&mut self, raw: Vec<u8>) {
        // SBD binary read in progress: bytes are not a text line
        if self.at_ring.head_body() == Some("+SBDRB") {
            self.handle_sbd_rx(&raw);
            return;
        }

        let line = String::from_utf8_lossy(&raw).trim().to_string();

        // echo got turned back on unintentionally
        if let Some(head) = self.at_ring.head_body() {
            if head != "E" && !head.is_empty() && line == format!("AT{head}") {
                warn!("echo turned on, disabling");
                self.at_ring.push_front("E");
                return;
            }
        }

        if line == "OK" || line == "READY" || matches!(line.as_str(), "0" | "1" | "2" | "3") {
            self.post(Ev::Ack(line));
        } else if line == "RING" {
            self.post(Ev::Ring);
        } else if line == "SBDRING" {
            self.post(Ev::SbdBeginData {
                payload: Vec::new(),
                ring_alert: true,
            });
        } else if line.starts_with("CONNECT") {
            self.post(Ev::Ack(line));
            self.post(Ev::Connect);
        } else if line == "NO CARRIER" || line == "NO DIALTONE" || line == "BUSY" {
            self.post(Ev::Ack(line));
            self.post(Ev::NoCarrier);
        } else if line == "ERROR" {
            self.post(Ev::Reset);
        } else if line.starts_with("+SBDI") {
            self.post(Ev::SbdTransmitComplete(line));
        } else if line.starts_with("+CIEV") {
            self.parse_ciev(&line);
        } else if !line.is_empty() {
            debug!("unhandled line: {line}");
        }
    }

    fn handle_sbd_rx(&mut self, raw: &[u8]) {
        match self.sbd_rx.push(raw) {
            None => {} // keep building up the message
            Some(Ok(payload)) => {
                match header::parse_modem_message(&payload) {
                    Ok(msg) => self.push_received(msg),
                    Err(e) => warn!("could not decode SBD payload: {e}"),
                }
                let _ = self.at_ring.pop_front();
                self.post(Ev::SbdReceiveComplete);
                // dummy sentence to absorb the trailing OK
                self.at_ring.push("");
            }
            Some(Err(e)) => {
                warn!("bad SBD read: {e}");
                let _ = self.at_ring.pop_front();
                self.post(Ev::SbdReceiveComplete);
                self.at_ring.push("");
            }
        }
    }

    fn handle_tx_tick(&mut self) {
        match self.line {
            LineState::Online => self.on_call_tx(),
            LineState::Command(state) => {
                // pending redial after a NO CARRIER
                if state == CommandState::Dial {
                    if let Some(at) = self.redial_at {
                        if self.clock.now() >= at {
                            self.redial_at = None;
                            self.dial();
                        }
                    }
                }
                self.command_tx();
            }
        }
    }

    fn command_tx(&mut self) {
        let now = self.now_seconds();
        let Some(head) = self.at_ring.front() else {
            return;
        };
        let timeout = Self::command_timeout(&head.body);
        let due = head
            .last_send_time
            .is_none_or(|t| t.unix_seconds_f64() + timeout < now);
        if !due {
            return;
        }

        if self.at_ring.head_body() == Some("+SBDRB") {
            self.sbd_rx.clear();
        }

        let body = self.at_ring.head_body().unwrap_or("").to_string();
        let wire = if body == "+++" {
            body.clone().into_bytes()
        } else {
            format!("AT{body}\r").into_bytes()
        };

        let head = match self.at_ring.front_mut() {
            Some(h) => h,
            None => return,
        };
        head.tries += 1;
        if head.tries > RETRIES_BEFORE_RESET {
            warn!(
                "no valid response after {RETRIES_BEFORE_RESET} tries, resetting state machine"
            );
            self.post(Ev::Reset);
        } else {
            head.last_send_time = Some(self.clock.now());
            self.push_serial(wire);
        }
    }

    fn handle_ack(&mut self, response: &str) {
        // numeric codes from the SBD flow
        match response {
            "0" => {
                if self.at_ring.head_body() == Some("+SBDD2") {
                    self.post(Ev::SbdSendBufferCleared);
                } else if self.at_ring.is_empty() {
                    // raw data write finished; give the trailing OK an
                    // AT sentence to clear
                    self.post(Ev::SbdWriteComplete);
                    self.at_ring.push("");
                    return;
                }
                return; // followed by "OK" which clears the sentence
            }
            "1" | "2" | "3" => return,
            _ => {}
        }

        if self.at_ring.is_empty() {
            debug!("unexpected '{response}'");
            return;
        }

        let head = self.at_ring.head_body().unwrap_or("").to_string();
        if !head.is_empty() && response == "OK" {
            match head.as_bytes()[0] {
                b'H' => self.post(Ev::NoCarrier),
                // some ISUs answer a failed dial with a bare OK
                b'D' => self.post(Ev::NoCarrier),
                _ => {}
            }
        }
        if response == "READY" {
            self.post(Ev::SbdWriteReady);
        }

        let _ = self.at_ring.pop_front();
        if self.at_ring.is_empty() {
            self.post(Ev::AtEmpty);
        }
    }

    fn handle_no_carrier(&mut self) {
        if self.call == CallState::OnCall {
            self.leave_on_call();
        }
        match self.line {
            LineState::Command(CommandState::Dial) => {
                if self.dial_attempts_made < self.cfg.dial_attempts {
                    debug!("redialing in {REDIAL_WAIT_SECONDS} seconds");
                    self.redial_at = Some(
                        self.clock.now()
                            + std::time::Duration::from_secs_f64(REDIAL_WAIT_SECONDS),
                    );
                } else {
                    warn!(
                        "failed to connect after {} tries",
                        self.cfg.dial_attempts
                    );
                    self.enter_ready();
                }
            }
            LineState::Command(CommandState::Answer) => self.enter_ready(),
            _ => {}
        }
    }

    fn handle_sbdi(&mut self, sbdi: &str) {
        // +SBDIX:<MO status>,<MOMSN>,<MT status>,<MTMSN>,<MT length>,<MT queued>
        let fields: Vec<&str> = sbdi
            .split([':', ','])
            .map(str::trim)
            .collect();
        self.sbd_payload.clear();
        if fields.len() != 7 {
            debug!("invalid +SBDI response: {sbdi}");
            self.sbd = SbdState::Ready;
            return;
        }

        const MO_STATUS: usize = 1;
        const MT_STATUS: usize = 3;
        const MO_STATUS_SUCCESS_MAX: i32 = 4;
        const MT_STATUS_RECEIVED_MESSAGE: i32 = 1;

        let mo_status: i32 = fields[MO_STATUS].parse().unwrap_or(-1);
        if mo_status < 0 || mo_status > MO_STATUS_SUCCESS_MAX {
            warn!(
                "error sending SBD packet: {}",
                mo_status_as_string(mo_status)
            );
            self.sbd = SbdState::Ready;
            return;
        }
        debug!(
            "success sending SBDIX: {}",
            mo_status_as_string(mo_status)
        );

        let mt_status: i32 = fields[MT_STATUS].parse().unwrap_or(0);
        if mt_status == MT_STATUS_RECEIVED_MESSAGE {
            self.enter_sbd_receive();
        } else {
            self.sbd = SbdState::Ready;
        }
    }

    // ---- on-call (RUDICS) handling ----------------------------------

    fn on_call_rx(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        if text.contains("NO CARRIER") {
            self.post(Ev::NoCarrier);
            return;
        }
        let trimmed = text.trim_matches(['\0', '\r', '\n', ' ']);
        if trimmed == "goby" {
            debug!("detected start of RUDICS call");
        } else if trimmed == "bye" {
            debug!("detected remote completion of RUDICS call");
            self.on_call.bye_received = true;
        } else {
            match rudics::decode(raw).and_then(|bytes| header::parse_modem_message(&bytes)) {
                Ok(msg) => {
                    self.push_received(msg);
                    self.on_call.last_rx_time = self.now_seconds();
                }
                Err(e) => warn!("could not decode packet: {e}"),
            }
        }
    }

    fn on_call_tx(&mut self) {
        let target_byte_rate = self.cfg.target_bit_rate as f64 / 8.0;
        let send_wait = self.on_call.last_bytes_sent as f64 / target_byte_rate;
        let now = self.now_seconds();

        if !self.data_out.is_empty() && now > self.on_call.last_tx_time + send_wait {
            let Some(msg) = self.data_out.pop_front() else {
                return;
            };
            match header::serialize_modem_message(&msg) {
                Ok(bytes) => {
                    let packet = rudics::encode(&bytes);
                    self.on_call.last_bytes_sent = packet.len();
                    self.on_call.total_bytes_sent += packet.len();
                    self.on_call.last_tx_time = now;
                    self.push_serial(packet);
                }
                Err(e) => warn!("could not serialize transmission: {e}"),
            }
        }
    }
}

fn mo_status_as_string(code: i32) -> &'static str {
    match code {
        0 => "MO message, if any, transferred successfully",
        1 => "MO message transferred, but MT message in queue too big",
        2 => "MO message transferred, but location update not accepted",
        3 | 4 => "reserved, but indicates MO session success",
        10 => "GSS reported that the call did not complete in the allowed time",
        11 => "MO message queue at the GSS is full",
        12 => "MO message has too many segments",
        13 => "GSS reported that the session did not complete",
        14 => "invalid segment size",
        15 => "access is denied",
        16 => "modem has been locked and may not make SBD calls",
        17 => "gateway not responding (local session timeout)",
        18 => "connection lost (RF drop)",
        19 => "link failure (protocol error terminated the call)",
        32 => "no network service, unable to initiate call",
        35 => "Iridium 9523 is busy, unable to initiate call",
        _ => "reserved, but indicates MO session failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimePoint;
    use crate::transmission::TransmissionKind;
    use std::time::Duration;

    fn fsm() -> (IridiumFsm, Clock) {
        let clock = Clock::simulated(TimePoint::from_unix_seconds(0));
        let mut fsm = IridiumFsm::new(
            FsmConfig {
                config: vec!["E".into(), "&K0".into()],
                remote_number: Some("0088160000000".into()),
                ..FsmConfig::default()
            },
            clock.clone(),
        );
        fsm.initiate();
        (fsm, clock)
    }

    /// Answer every queued AT sentence with OK until the ring drains.
    fn ack_until_ready(fsm: &mut IridiumFsm, clock: &Clock) {
        for _ in 0..64 {
            clock.advance(Duration::from_secs(3));
            fsm.process(Ev::TxTick);
            if fsm.pop_serial_tx().is_some() {
                fsm.process(Ev::RxLine(b"OK\r".to_vec()));
            }
            if fsm.is_ready() {
                return;
            }
        }
        panic!("never reached Ready");
    }

    #[test]
    fn configure_reaches_ready_on_acks() {
        let (mut fsm, clock) = fsm();
        assert!(matches!(
            fsm.line,
            LineState::Command(CommandState::Configure)
        ));
        ack_until_ready(&mut fsm, &clock);
        assert!(fsm.is_ready());
    }

    #[test]
    fn error_storm_recovers_to_ready() {
        let (mut fsm, clock) = fsm();
        // every response is ERROR; resets must not deadlock and acks
        // afterwards must still drive the machine to Ready
        for _ in 0..10 {
            clock.advance(Duration::from_secs(3));
            fsm.process(Ev::TxTick);
            let _ = fsm.pop_serial_tx();
            fsm.process(Ev::RxLine(b"ERROR\r".to_vec()));
        }
        ack_until_ready(&mut fsm, &clock);
        assert!(fsm.is_ready());
    }

    #[test]
    fn timeouts_alone_recover_to_ready() {
        let (mut fsm, clock) = fsm();
        // no responses at all: each sentence retries, then the reset
        // fires, indefinitely; after the noise, acks still get us home
        for _ in 0..30 {
            clock.advance(Duration::from_secs(5));
            fsm.process(Ev::TxTick);
            let _ = fsm.pop_serial_tx();
        }
        ack_until_ready(&mut fsm, &clock);
        assert!(fsm.is_ready());
    }

    #[test]
    fn sbd_write_transmit_receive_cycle() {
        let (mut fsm, clock) = fsm();
        ack_until_ready(&mut fsm, &clock);

        let payload = header::serialize_modem_message(&ModemTransmission {
            src: 1,
            dest: 2,
            kind: TransmissionKind::Data,
            frames: vec![b"HELLOWORLD".to_vec()],
            ..Default::default()
        })
        .unwrap();

        fsm.process(Ev::SbdBeginData {
            payload: payload.clone(),
            ring_alert: false,
        });
        assert_eq!(fsm.sbd, SbdState::ClearBuffers);

        // +SBDD2 goes out; "0" then "OK" come back
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        assert_eq!(fsm.pop_serial_tx().unwrap(), b"AT+SBDD2\r".to_vec());
        fsm.process(Ev::RxLine(b"0\r".to_vec()));
        fsm.process(Ev::RxLine(b"OK\r".to_vec()));
        assert_eq!(fsm.sbd, SbdState::Write);

        // +SBDWB goes out; READY prompts the raw write
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        assert_eq!(
            fsm.pop_serial_tx().unwrap(),
            format!("AT+SBDWB={}\r", payload.len()).into_bytes()
        );
        fsm.process(Ev::RxLine(b"READY\r".to_vec()));
        let written = fsm.pop_serial_tx().unwrap();
        assert_eq!(written, sbd::append_checksum(&payload));

        // modem confirms the buffer write with 0 (no AT head pending)
        fsm.process(Ev::RxLine(b"0\r".to_vec()));
        fsm.process(Ev::RxLine(b"OK\r".to_vec()));
        assert_eq!(fsm.sbd, SbdState::Transmit);

        // +SBDIX goes out; gateway reports MO ok and one MT waiting
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        assert_eq!(fsm.pop_serial_tx().unwrap(), b"AT+SBDIX\r".to_vec());
        fsm.process(Ev::RxLine(b"+SBDIX: 0, 100, 1, 42, 12, 0\r".to_vec()));
        assert_eq!(fsm.sbd, SbdState::Receive);
        fsm.process(Ev::RxLine(b"OK\r".to_vec()));

        // +SBDRB goes out; binary response carries a message for us
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        assert_eq!(fsm.pop_serial_tx().unwrap(), b"AT+SBDRB\r".to_vec());

        let inbound = header::serialize_modem_message(&ModemTransmission {
            src: 2,
            dest: 1,
            kind: TransmissionKind::Data,
            frames: vec![b"HELLOWORLD".to_vec()],
            ..Default::default()
        })
        .unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&(inbound.len() as u16).to_be_bytes());
        wire.extend_from_slice(&sbd::append_checksum(&inbound));
        fsm.process(Ev::RxLine(wire));
        fsm.process(Ev::RxLine(b"OK\r".to_vec()));

        assert_eq!(fsm.sbd, SbdState::Ready);
        let msg = fsm.pop_received().unwrap();
        assert_eq!(msg.frames, vec![b"HELLOWORLD".to_vec()]);
        assert_eq!(msg.src, 2);
    }

    #[test]
    fn failed_mo_status_returns_to_ready_dropping_mt() {
        let (mut fsm, clock) = fsm();
        ack_until_ready(&mut fsm, &clock);

        fsm.process(Ev::SbdBeginData {
            payload: b"data".to_vec(),
            ring_alert: false,
        });
        fsm.sbd = SbdState::Transmit; // skip ahead to the verdict
        fsm.process(Ev::SbdTransmitComplete("+SBDIX: 13, 0, 1, 0, 0, 0".into()));
        assert_eq!(fsm.sbd, SbdState::Ready, "MO failure drops the MT flow");
    }

    #[test]
    fn ring_alert_mid_session_does_not_switch_to_sbdixa() {
        let (mut fsm, clock) = fsm();
        ack_until_ready(&mut fsm, &clock);

        fsm.process(Ev::SbdBeginData {
            payload: b"data".to_vec(),
            ring_alert: false,
        });
        assert_eq!(fsm.sbd, SbdState::ClearBuffers);
        // ring alert lands mid-session; the running session keeps +SBDIX
        fsm.process(Ev::RxLine(b"SBDRING\r".to_vec()));
        assert_eq!(fsm.sbd, SbdState::ClearBuffers);
        assert!(!fsm.sbd_ring_alert);
    }

    #[test]
    fn rudics_dial_and_call_flow() {
        let (mut fsm, clock) = fsm();
        ack_until_ready(&mut fsm, &clock);

        fsm.process(Ev::Dial);
        assert!(matches!(fsm.line, LineState::Command(CommandState::Dial)));
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        assert_eq!(
            fsm.pop_serial_tx().unwrap(),
            b"ATD0088160000000\r".to_vec()
        );

        fsm.process(Ev::RxLine(b"CONNECT 9600\r".to_vec()));
        assert!(fsm.is_on_call());
        assert_eq!(fsm.line, LineState::Online);
        // the goby banner leads the stream
        assert_eq!(fsm.pop_serial_tx().unwrap(), b"goby\r".to_vec());

        // data flows at the target rate
        fsm.buffer_data_out(ModemTransmission {
            src: 1,
            dest: 2,
            rate: RATE_RUDICS,
            frames: vec![b"stream-me".to_vec()],
            ..Default::default()
        });
        clock.advance(Duration::from_secs(1));
        fsm.process(Ev::TxTick);
        let packet = fsm.pop_serial_tx().unwrap();
        assert_eq!(*packet.last().unwrap(), b'\r');
        let decoded = rudics::decode(&packet).unwrap();
        let msg = header::parse_modem_message(&decoded).unwrap();
        assert_eq!(msg.frames, vec![b"stream-me".to_vec()]);

        // remote says bye; we answer and the call ends on NO CARRIER
        fsm.process(Ev::RxLine(b"bye\r".to_vec()));
        assert!(fsm.on_call.bye_received);
        fsm.process(Ev::SendBye);
        assert!(fsm.on_call.bye_sent);
        assert_eq!(fsm.pop_serial_tx().unwrap(), b"bye\r".to_vec());

        fsm.process(Ev::RxLine(b"NO CARRIER\r".to_vec()));
        assert!(!fsm.is_on_call());
        assert!(matches!(
            fsm.line,
            LineState::Command(CommandState::PostDisconnected)
        ));
    }

    #[test]
    fn redial_waits_then_gives_up() {
        let (mut fsm, clock) = fsm();
        ack_until_ready(&mut fsm, &clock);

        fsm.process(Ev::Dial);
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        let _ = fsm.pop_serial_tx();

        for attempt in 1..=2 {
            fsm.process(Ev::RxLine(b"NO CARRIER\r".to_vec()));
            assert!(
                matches!(fsm.line, LineState::Command(CommandState::Dial)),
                "attempt {attempt} should stay in Dial"
            );
            // redial is scheduled, not immediate
            fsm.process(Ev::TxTick);
            clock.advance(Duration::from_secs(3));
            fsm.process(Ev::TxTick);
            assert!(
                fsm.pop_serial_tx()
                    .is_some_and(|l| l.starts_with(b"ATD")),
                "attempt {attempt} should redial"
            );
        }

        // third NO CARRIER exhausts dial_attempts = 3
        fsm.process(Ev::RxLine(b"NO CARRIER\r".to_vec()));
        assert!(fsm.is_ready());
    }

    #[test]
    fn ciev_reports_update_signal_data() {
        let (mut fsm, _clock) = fsm();
        fsm.process(Ev::RxLine(b"+CIEV:0,4\r".to_vec()));
        fsm.process(Ev::RxLine(b"+CIEV:1,1\r".to_vec()));
        assert_eq!(fsm.ciev.rssi, Some(4));
        assert_eq!(fsm.ciev.service_available, Some(true));
    }

    #[test]
    fn echo_detection_pushes_echo_off() {
        let (mut fsm, clock) = fsm();
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        let _ = fsm.pop_serial_tx(); // "AT\r" for the "" sentence
        // ack the bare AT so the head becomes a real sentence
        fsm.process(Ev::RxLine(b"OK\r".to_vec()));
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        let sent = fsm.pop_serial_tx().unwrap();
        assert_eq!(sent, b"ATE\r".to_vec());
        // skip past "E" to a config sentence, then echo it back
        fsm.process(Ev::RxLine(b"OK\r".to_vec()));
        clock.advance(Duration::from_secs(3));
        fsm.process(Ev::TxTick);
        assert_eq!(fsm.pop_serial_tx().unwrap(), b"AT&K0\r".to_vec());
        fsm.process(Ev::RxLine(b"AT&K0\r".to_vec()));
        assert_eq!(fsm.at_ring.head_body(), Some("E"), "echo-off pushed to front");
    }
}
