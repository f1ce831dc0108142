//! Mobile-side Iridium driver: Short Burst Data transactions and
//! dial-up RUDICS streaming over an AT command line.
//!
//! The wire protocol lives in [`fsm`]; this module owns the modem
//! connection, pumps the FSM from `do_work`, applies the call-liveness
//! policy (keep the pipe full, send `bye`, hang up), and translates
//! between transmissions and the queue layer.

use std::time::Duration;

use log::{debug, warn};

use crate::clock::{Clock, TimePoint};
use crate::line_io::LineIoConfig;
use crate::protocol::header;
use crate::transmission::{ModemTransmission, TransmissionKind};

use super::{
    DriverConfig, DriverError, DriverEvent, ModemBase, ModemDriver, PayloadSource,
};

pub mod fsm;

pub use fsm::{RATE_RUDICS, RATE_SBD};

use fsm::{Ev, IridiumFsm};

/// Wait after sending `+++` before anything else goes to the modem.
const TRIPLE_PLUS_WAIT: f64 = 2.0;

/// Largest frame riding in one transmission, by rate code.
const FRAME_BITS: u32 = 11;

#[derive(Debug, Clone)]
pub struct IridiumConfig {
    /// Extra AT configuration pushed during `Configure`.
    pub config: Vec<String>,
    /// Number dialed for RUDICS service.
    pub remote_number: Option<String>,
    pub max_frame_size: u32,
    pub target_bit_rate: u32,
    pub dial_attempts: u8,
    /// Send our `bye` after this long without transmitting.
    pub handshake_hangup_seconds: f64,
    /// Hang up after this long with no traffic either way.
    pub hangup_seconds_after_empty: f64,
    /// Give the modem this long to reach `Ready` after startup.
    pub start_timeout: Duration,
    /// Hang up with a DTR low-pulse instead of `+++`/`ATH`. Defaults on
    /// for serial connections.
    pub use_dtr: Option<bool>,
    /// An SBD slot with no payload still runs a mailbox check.
    pub if_no_data_do_mailbox_check: bool,
}

impl Default for IridiumConfig {
    fn default() -> Self {
        IridiumConfig {
            config: Vec::new(),
            remote_number: None,
            max_frame_size: 300,
            target_bit_rate: 2400,
            dial_attempts: 3,
            handshake_hangup_seconds: 30.0,
            hangup_seconds_after_empty: 30.0,
            start_timeout: Duration::from_secs(20),
            use_dtr: None,
            if_no_data_do_mailbox_check: true,
        }
    }
}

#[derive(Debug)]
pub struct IridiumDriver {
    base: ModemBase,
    iridium_cfg: IridiumConfig,
    fsm: IridiumFsm,
    use_dtr: bool,
    next_frame: u32,
    last_triple_plus_time: f64,
    startup_deadline: Option<TimePoint>,
    /// Template used to keep an open call full of data.
    rudics_mac_msg: ModemTransmission,
    shutdown: bool,
}

impl IridiumDriver {
    pub fn new(cfg: DriverConfig, iridium_cfg: IridiumConfig, clock: Clock) -> Self {
        let use_dtr = iridium_cfg
            .use_dtr
            .unwrap_or(matches!(cfg.connection, LineIoConfig::Serial { .. }));

        let mut fsm_cfg = fsm::FsmConfig {
            config: iridium_cfg.config.clone(),
            remote_number: iridium_cfg.remote_number.clone(),
            dial_attempts: iridium_cfg.dial_attempts,
            target_bit_rate: iridium_cfg.target_bit_rate,
        };
        if use_dtr {
            // dtr low hangs up
            fsm_cfg.config.push("&D2".into());
        }

        let rudics_mac_msg = ModemTransmission {
            src: cfg.modem_id,
            kind: TransmissionKind::Data,
            rate: RATE_RUDICS,
            ..Default::default()
        };

        IridiumDriver {
            fsm: IridiumFsm::new(fsm_cfg, clock.clone()),
            base: ModemBase::new(cfg, clock),
            iridium_cfg,
            use_dtr,
            next_frame: 0,
            last_triple_plus_time: 0.0,
            startup_deadline: None,
            rudics_mac_msg,
            shutdown: false,
        }
    }

    fn now_seconds(&self) -> f64 {
        self.base.clock().now().unix_seconds_f64()
    }

    fn hangup(&mut self) {
        if self.use_dtr {
            // the phone gives no NO CARRIER after a DTR disconnect
            if let Err(e) = self.base.set_dtr(false) {
                warn!("DTR hangup failed: {e}");
            }
            self.fsm.process(Ev::NoCarrier);
        } else {
            self.fsm.process(Ev::Hangup);
        }
    }

    fn send(&mut self, msg: ModemTransmission) {
        debug!("buffering outgoing transmission at rate {}", msg.rate);
        if msg.rate == RATE_RUDICS || self.fsm.is_on_call() {
            self.fsm.buffer_data_out(msg);
        } else if msg.rate == RATE_SBD {
            match header::serialize_modem_message(&msg) {
                Ok(payload) => self.fsm.process(Ev::SbdBeginData {
                    payload,
                    ring_alert: false,
                }),
                Err(e) => warn!("cannot serialize transmission: {e}"),
            }
        } else {
            warn!("invalid rate {} for the Iridium driver", msg.rate);
        }
    }

    fn process_transmission(
        &mut self,
        orig: &ModemTransmission,
        dial: bool,
        source: &mut dyn PayloadSource,
    ) {
        let mut msg = orig.clone();
        source.modify_transmission(&mut msg);

        if msg.frame_start.is_none() {
            msg.frame_start = Some(self.next_frame % (1u32 << FRAME_BITS));
        }
        // cap the frame size at what the service supports
        let max = self.iridium_cfg.max_frame_size;
        if msg.max_frame_bytes.is_none_or(|b| b > max) {
            msg.max_frame_bytes = Some(max);
        }

        source.data_request(&mut msg);
        self.next_frame += msg.frames.len() as u32;

        if !msg.frames_empty() {
            if dial && msg.rate == RATE_RUDICS {
                self.fsm.process(Ev::Dial);
            }
            self.send(msg);
        } else if msg.rate == RATE_SBD && self.iridium_cfg.if_no_data_do_mailbox_check {
            self.fsm.process(Ev::SbdBeginData {
                payload: Vec::new(),
                ring_alert: false,
            });
        }
    }

    fn receive(&mut self, msg: ModemTransmission) {
        debug!("received {msg:?}");
        if msg.kind == TransmissionKind::Data
            && msg.wants_ack()
            && msg.dest == self.base.cfg().modem_id
        {
            let mut ack = ModemTransmission::ack_of(&msg);
            ack.time = Some(self.base.clock().now());
            self.send(ack);
        }
        self.base.push_event(DriverEvent::Receive(msg));
    }

    fn try_serial_tx(&mut self) -> Result<(), DriverError> {
        self.fsm.process(Ev::TxTick);

        while let Some(line) = self.fsm.pop_serial_tx() {
            let now = self.now_seconds();
            if self.last_triple_plus_time + TRIPLE_PLUS_WAIT > now {
                // give the escape guard time its silence
                return Ok(());
            }
            self.base.modem_write(&line)?;
            // safe: all other traffic is \r terminated
            if line == b"+++" {
                self.last_triple_plus_time = now;
            }
        }
        Ok(())
    }
}

impl ModemDriver for IridiumDriver {
    fn startup(&mut self) -> Result<(), DriverError> {
        debug!("Iridium RUDICS/SBD driver starting up");
        self.shutdown = false;
        self.base.modem_start()?;
        if self.use_dtr {
            if let Err(e) = self.base.set_dtr(true) {
                warn!("could not assert DTR: {e}");
            }
        }
        self.fsm.initiate();
        self.startup_deadline = Some(self.base.clock().now() + self.iridium_cfg.start_timeout);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.hangup();
        // push the escape/hangup dialog out before closing
        for _ in 0..3 {
            let _ = self.try_serial_tx();
        }
        if self.use_dtr {
            let _ = self.base.set_dtr(false);
        }
        self.shutdown = true;
        self.base.modem_close();
    }

    fn do_work(&mut self, source: &mut dyn PayloadSource) -> Result<(), DriverError> {
        if self.shutdown {
            return Ok(());
        }

        // configuration dialog must converge within the start timeout
        if let Some(deadline) = self.startup_deadline {
            if self.fsm.is_ready() {
                self.startup_deadline = None;
            } else if self.base.clock().now() > deadline {
                self.startup_deadline = None;
                return Err(DriverError::NotResponding(
                    "modem did not reach Ready within the start timeout".into(),
                ));
            }
        }

        let now = self.now_seconds();
        if self.fsm.is_on_call() {
            let stats = self.fsm.on_call;
            let send_wait =
                stats.last_bytes_sent as f64 / (self.iridium_cfg.target_bit_rate as f64 / 8.0);

            // keep pushing data at the target rate while the call is up
            if self.fsm.data_out_empty()
                && now > stats.last_tx_time + send_wait
                && !stats.bye_sent
            {
                let template = self.rudics_mac_msg.clone();
                self.process_transmission(&template, false, source);
            }

            if !stats.bye_sent
                && now > stats.last_tx_time + self.iridium_cfg.handshake_hangup_seconds
            {
                debug!("sending bye");
                self.fsm.process(Ev::SendBye);
            }

            if (stats.bye_received && stats.bye_sent)
                || now > stats.last_rx_tx_time() + self.iridium_cfg.hangup_seconds_after_empty
            {
                self.hangup();
            }
        }

        self.try_serial_tx()?;

        while let Some(line) = self.base.modem_read() {
            self.fsm.process(Ev::RxLine(line));
        }

        while let Some(msg) = self.fsm.pop_received() {
            self.receive(msg);
        }

        // signal data gleaned from +CIEV reports
        self.base.report_mut().rssi = self.fsm.ciev.rssi;
        self.base.report_mut().service_available = self.fsm.ciev.service_available;

        // push anything the FSM just generated before we wait
        self.try_serial_tx()
    }

    fn handle_initiate_transmission(
        &mut self,
        msg: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError> {
        self.process_transmission(msg, true, source);
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
    use crate::line_io::{LineIo, MemEndpoint};
    use crate::protocol::sbd;

    fn driver() -> (IridiumDriver, MemEndpoint, Clock) {
        let (ours, theirs) = MemEndpoint::pair(b"\r");
        let clock = Clock::simulated(TimePoint::from_unix_seconds(0));
        let cfg = DriverConfig {
            modem_id: 1,
            connection: LineIoConfig::Mem(ours),
            line_delimiter: b"\r".to_vec(),
        };
        let mut d = IridiumDriver::new(cfg, IridiumConfig::default(), clock.clone());
        d.startup().unwrap();
        (d, theirs, clock)
    }

    /// Play the modem: ack every AT sentence until the dialog quiesces.
    fn ack_all(driver: &mut IridiumDriver, wire: &mut MemEndpoint, clock: &Clock) {
        for _ in 0..32 {
            clock.advance(Duration::from_secs(3));
            driver.do_work(&mut NullSource).unwrap();
            let mut saw = false;
            while let Ok(line) = wire.read() {
                if line.starts_with(b"AT") {
                    wire.write(b"OK\r").unwrap();
                    saw = true;
                }
            }
            driver.do_work(&mut NullSource).unwrap();
            if !saw && driver.fsm.is_ready() {
                return;
            }
        }
        panic!("dialog never quiesced");
    }

    #[test]
    fn sbd_receive_end_to_end() {
        let (mut driver, mut wire, clock) = driver();
        wire.start().unwrap();
        ack_all(&mut driver, &mut wire, &clock);

        // mailbox check kicks off an SBD session
        let slot = ModemTransmission {
            src: 1,
            dest: 2,
            rate: RATE_SBD,
            kind: TransmissionKind::Data,
            ..Default::default()
        };
        driver
            .handle_initiate_transmission(&slot, &mut NullSource)
            .unwrap();

        // walk the modem dialog: SBDD2, (skip write: mailbox check), SBDIX
        clock.advance(Duration::from_secs(3));
        driver.do_work(&mut NullSource).unwrap();
        assert_eq!(wire.read().unwrap(), b"AT+SBDD2\r".to_vec());
        wire.write(b"0\r").unwrap();
        wire.write(b"OK\r").unwrap();
        clock.advance(Duration::from_secs(3));
        driver.do_work(&mut NullSource).unwrap();
        // mailbox check posts write-complete immediately; SBDIX next
        clock.advance(Duration::from_secs(3));
        driver.do_work(&mut NullSource).unwrap();
        let mut lines = Vec::new();
        while let Ok(l) = wire.read() {
            lines.push(l);
        }
        assert!(lines.contains(&b"AT+SBDIX\r".to_vec()), "lines: {lines:?}");

        // MT message waiting
        wire.write(b"+SBDIX: 0, 100, 1, 42, 12, 0\r").unwrap();
        wire.write(b"OK\r").unwrap();
        clock.advance(Duration::from_secs(3));
        driver.do_work(&mut NullSource).unwrap();
        clock.advance(Duration::from_secs(3));
        driver.do_work(&mut NullSource).unwrap();
        let mut lines = Vec::new();
        while let Ok(l) = wire.read() {
            lines.push(l);
        }
        assert!(lines.contains(&b"AT+SBDRB\r".to_vec()), "lines: {lines:?}");

        // binary body: length ‖ (header+frame) ‖ checksum, then OK
        let payload = header::serialize_modem_message(&ModemTransmission {
            src: 2,
            dest: 1,
            rate: RATE_SBD,
            kind: TransmissionKind::Data,
            frames: vec![b"HELLOWORLD".to_vec()],
            ..Default::default()
        })
        .unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        body.extend_from_slice(&sbd::append_checksum(&payload));
        body.extend_from_slice(b"\r"); // flushes the line framing
        wire.write(&body).unwrap();
        wire.write(b"OK\r").unwrap();
        driver.do_work(&mut NullSource).unwrap();

        let mut received = Vec::new();
        while let Some(ev) = driver.poll_event() {
            if let DriverEvent::Receive(m) = ev {
                received.push(m);
            }
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].frames, vec![b"HELLOWORLD".to_vec()]);
        assert_eq!(received[0].src, 2);
    }

    #[test]
    fn startup_timeout_reports_not_responding() {
        let (mut driver, mut wire, clock) = driver();
        wire.start().unwrap();
        // the modem never answers
        clock.advance(Duration::from_secs(25));
        let err = driver.do_work(&mut NullSource).unwrap_err();
        assert!(matches!(err, DriverError::NotResponding(_)));
    }
}
