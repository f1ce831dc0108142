//! In-process modem simulators for tests and examples.
//!
//! [`AbcModemSimulator`] plays the shared acoustic channel for a set of
//! ABC drivers: each driver attaches to one simulated line, registers
//! its MAC address with a `CONF,MAC:` line, and the simulator routes
//! `SEND` lines to the destination as `RECV` (plus an `ACKN` back to the
//! sender when requested) the way the real channel would.

use std::collections::HashMap;

use log::{debug, warn};

use crate::consts::{BROADCAST_ID, ModemId};
use crate::line_io::{LineIo, MemEndpoint};

fn parse_in(line: &str) -> Option<HashMap<String, String>> {
    let mut out = HashMap::new();
    let mut parts = line.split(',');
    out.insert("KEY".to_string(), parts.next()?.to_string());
    for part in parts {
        let (field, value) = part.split_once(':')?;
        out.insert(field.to_string(), value.to_string());
    }
    Some(out)
}

/// The shared-channel end of N simulated ABC modems.
#[derive(Debug, Default)]
pub struct AbcModemSimulator {
    lines: Vec<MemEndpoint>,
    modem_ids: HashMap<ModemId, usize>,
}

impl AbcModemSimulator {
    pub fn new() -> Self {
        AbcModemSimulator::default()
    }

    /// Create one simulated line; the returned endpoint goes into the
    /// driver's connection configuration.
    pub fn attach(&mut self) -> MemEndpoint {
        let (ours, theirs) = MemEndpoint::pair(b"\r\n");
        let mut ours = ours;
        // the channel side is always up
        let _ = ours.start();
        self.lines.push(ours);
        theirs
    }

    fn write_to(&mut self, endpoint: usize, line: &str) {
        debug!("sim -> line {endpoint}: {}", line.trim_end());
        if let Err(e) = self.lines[endpoint].write(line.as_bytes()) {
            warn!("sim write failed: {e}");
        }
    }

    fn process(&mut self, from: usize, line: &str) {
        let Some(parsed) = parse_in(line) else {
            warn!("invalid line from modem: {line}");
            return;
        };
        match parsed["KEY"].as_str() {
            "CONF" => {
                if let Some(mac) = parsed.get("MAC").and_then(|m| m.parse().ok()) {
                    debug!("set MAC address {mac} for line {from}");
                    self.modem_ids.insert(mac, from);
                }
            }
            "SEND" => {
                let (Some(src), Some(dest)) = (
                    parsed.get("FROM").and_then(|v| v.parse::<ModemId>().ok()),
                    parsed.get("TO").and_then(|v| v.parse::<ModemId>().ok()),
                ) else {
                    warn!("SEND missing FROM/TO: {line}");
                    return;
                };
                let (Some(hex_data), Some(bitrate)) =
                    (parsed.get("HEX").cloned(), parsed.get("BITRATE").cloned())
                else {
                    warn!("SEND missing HEX/BITRATE: {line}");
                    return;
                };

                let recv = format!("RECV,FROM:{src},TO:{dest},HEX:{hex_data},BITRATE:{bitrate}\r\n");
                if dest == BROADCAST_ID {
                    let receivers: Vec<usize> = self
                        .modem_ids
                        .iter()
                        .filter(|(id, _)| **id != src)
                        .map(|(_, ep)| *ep)
                        .collect();
                    for ep in receivers {
                        self.write_to(ep, &recv);
                    }
                } else {
                    let Some(&ep) = self.modem_ids.get(&dest) else {
                        warn!("unknown destination ID {dest}");
                        return;
                    };
                    self.write_to(ep, &recv);

                    if parsed.get("ACK").map(String::as_str) == Some("TRUE") {
                        let ackn = format!("ACKN,FROM:{dest},TO:{src}\r\n");
                        self.write_to(from, &ackn);
                    }
                }
            }
            other => debug!("ignoring key {other}"),
        }
    }

    /// Route every pending line. Call from the test/demo loop.
    pub fn do_work(&mut self) {
        for idx in 0..self.lines.len() {
            loop {
                match self.lines[idx].read() {
                    Ok(raw) => {
                        let line = String::from_utf8_lossy(&raw).trim().to_string();
                        debug!("sim <- line {idx}: {line}");
                        self.process(idx, &line);
                    }
                    Err(nb::Error::WouldBlock) => break,
                    Err(nb::Error::Other(e)) => {
                        warn!("sim read failed on line {idx}: {e}");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_send_to_dest_with_ack() {
        let mut sim = AbcModemSimulator::new();
        let mut a = sim.attach();
        let mut b = sim.attach();
        a.start().unwrap();
        b.start().unwrap();

        a.write(b"CONF,MAC:1\r\n").unwrap();
        b.write(b"CONF,MAC:2\r\n").unwrap();
        sim.do_work();

        a.write(b"SEND,TO:2,FROM:1,HEX:abcd,BITRATE:1000,ACK:TRUE\r\n")
            .unwrap();
        sim.do_work();

        let at_b = b.read().unwrap();
        assert_eq!(
            String::from_utf8_lossy(&at_b).trim(),
            "RECV,FROM:1,TO:2,HEX:abcd,BITRATE:1000"
        );
        let at_a = a.read().unwrap();
        assert_eq!(String::from_utf8_lossy(&at_a).trim(), "ACKN,FROM:2,TO:1");
    }

    #[test]
    fn broadcast_reaches_everyone_but_the_sender() {
        let mut sim = AbcModemSimulator::new();
        let mut a = sim.attach();
        let mut b = sim.attach();
        let mut c = sim.attach();
        for ep in [&mut a, &mut b, &mut c] {
            ep.start().unwrap();
        }
        a.write(b"CONF,MAC:1\r\n").unwrap();
        b.write(b"CONF,MAC:2\r\n").unwrap();
        c.write(b"CONF,MAC:3\r\n").unwrap();
        sim.do_work();

        a.write(b"SEND,TO:0,FROM:1,HEX:ff,BITRATE:100,ACK:FALSE\r\n")
            .unwrap();
        sim.do_work();

        assert!(b.read().is_ok());
        assert!(c.read().is_ok());
        assert!(a.read().is_err(), "no echo back to the sender");
    }
}
