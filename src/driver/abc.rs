//! The ABC example modem: a deliberately simple ASCII wire protocol used
//! by the tutorial, the simulator, and a fair number of tests.
//!
//! Grammar (one `KEY,FIELD:VALUE,…` line per message):
//!
//! ```text
//! CONF,MAC:1                      configuration at startup
//! SEND,TO:2,FROM:1,HEX:0a0b,BITRATE:1000,ACK:TRUE
//! RECV,TO:2,FROM:1,HEX:0a0b,BITRATE:1000
//! ACKN,FROM:2,TO:1
//! ```

use std::collections::HashMap;

use log::{debug, warn};

use crate::clock::Clock;
use crate::transmission::{ModemTransmission, TransmissionKind};

use super::{
    DriverConfig, DriverError, DriverEvent, ModemBase, ModemDriver, PayloadSource,
};

/// Bitrate codes 0..=5 mapped onto the modem's real rates.
const BITRATE: [u32; 6] = [100, 1000, 10000, 10000, 10000, 10000];

const MAX_FRAME_BYTES: u32 = 500;

#[derive(Debug, Clone, Default)]
pub struct AbcDriverConfig {
    pub enable_foo: bool,
    pub enable_bar: bool,
}

#[derive(Debug)]
pub struct AbcDriver {
    base: ModemBase,
    abc_cfg: AbcDriverConfig,
    shutdown: bool,
}

impl AbcDriver {
    pub fn new(cfg: DriverConfig, abc_cfg: AbcDriverConfig, clock: Clock) -> Self {
        AbcDriver {
            base: ModemBase::new(cfg, clock),
            abc_cfg,
            shutdown: false,
        }
    }

    fn write_line(&mut self, line: String) -> Result<(), DriverError> {
        debug!("{}", line.trim_end());
        self.base.modem_write(line.as_bytes())
    }

    /// Split `KEY,FIELD:VALUE,…` into a field map (the key under `KEY`).
    fn parse_line(line: &str) -> Option<HashMap<String, String>> {
        let mut out = HashMap::new();
        let mut parts = line.split(',');
        out.insert("KEY".to_string(), parts.next()?.to_string());
        for part in parts {
            let (field, value) = part.split_once(':')?;
            out.insert(field.to_string(), value.to_string());
        }
        Some(out)
    }

    fn handle_line(&mut self, line: &str) -> Option<ModemTransmission> {
        let parsed = Self::parse_line(line)?;
        let src: i32 = parsed.get("FROM")?.parse().ok()?;
        let dest: i32 = parsed.get("TO")?.parse().ok()?;

        let mut msg = ModemTransmission {
            src,
            dest,
            time: Some(self.base.clock().now()),
            ..Default::default()
        };
        match parsed.get("KEY")?.as_str() {
            "RECV" => {
                msg.kind = TransmissionKind::Data;
                msg.frames.push(hex::decode(parsed.get("HEX")?).ok()?);
                debug!("received data {}", parsed["HEX"]);
            }
            "ACKN" => {
                msg.kind = TransmissionKind::Ack;
            }
            other => {
                debug!("ignoring line with key {other}");
                return None;
            }
        }
        Some(msg)
    }
}

impl ModemDriver for AbcDriver {
    fn startup(&mut self) -> Result<(), DriverError> {
        debug!("ABC driver starting up");
        self.shutdown = false;
        self.base.modem_start()?;

        let id = self.base.cfg().modem_id;
        self.write_line(format!("CONF,MAC:{id}\r\n"))?;
        self.write_line(format!("CONF,FOO:{}\r\n", self.abc_cfg.enable_foo as u8))?;
        self.write_line(format!("CONF,BAR:{}\r\n", self.abc_cfg.enable_bar as u8))?;
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
        while let Some(raw) = self.base.modem_read() {
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            match self.handle_line(&line) {
                Some(msg) => self.base.push_event(DriverEvent::Receive(msg)),
                None => warn!("bad line: {line}"),
            }
        }
        Ok(())
    }

    fn handle_initiate_transmission(
        &mut self,
        orig: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError> {
        let mut msg = orig.clone();
        debug!(
            "asked to transmit from {} to {} at bitrate code {}",
            msg.src, msg.dest, msg.rate
        );
        source.modify_transmission(&mut msg);

        msg.max_frame_bytes = Some(MAX_FRAME_BYTES);
        if msg.frames.is_empty() {
            source.data_request(&mut msg);
        }
        if msg.frames_empty() {
            debug!("no data to send");
            return Ok(());
        }

        let rate = BITRATE[(msg.rate.clamp(0, 5)) as usize];
        let ack = if msg.wants_ack() { "TRUE" } else { "FALSE" };
        let line = format!(
            "SEND,TO:{},FROM:{},HEX:{},BITRATE:{rate},ACK:{ack}\r\n",
            msg.dest,
            msg.src,
            hex::encode(&msg.frames[0]),
        );
        self.write_line(line)?;
        self.base.push_event(DriverEvent::TransmitResult(msg));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.base.poll_event()
    }

    fn report(&self) -> crate::transmission::ModemReport {
        self.base.report()
    }
}
