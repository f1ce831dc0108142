//! In-memory transport pair for tests and modem simulators.
//!
//! [`MemEndpoint::pair`] returns two connected endpoints: bytes written
//! to one become readable, line by line, from the other. Endpoints clone
//! cheaply and clones share the underlying channel, so a simulator can
//! keep a handle to the far side of a driver's "wire".

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{LineBuffer, LineIo, LineIoError, LineIoErrorKind};

#[derive(Debug, Default)]
struct Shared {
    bytes: VecDeque<u8>,
    /// Simulates a dead wire: started endpoints refuse to come up.
    broken: bool,
}

/// One side of an in-memory duplex line.
#[derive(Debug, Clone)]
pub struct MemEndpoint {
    rx: Arc<Mutex<Shared>>,
    tx: Arc<Mutex<Shared>>,
    line_buf: LineBuffer,
    active: bool,
}

impl MemEndpoint {
    /// Two endpoints wired back to back, both framing on `delimiter`.
    pub fn pair(delimiter: &[u8]) -> (MemEndpoint, MemEndpoint) {
        let a = Arc::new(Mutex::new(Shared::default()));
        let b = Arc::new(Mutex::new(Shared::default()));
        (
            MemEndpoint {
                rx: a.clone(),
                tx: b.clone(),
                line_buf: LineBuffer::new(delimiter),
                active: false,
            },
            MemEndpoint {
                rx: b,
                tx: a,
                line_buf: LineBuffer::new(delimiter),
                active: false,
            },
        )
    }

    pub(crate) fn set_delimiter(&mut self, delimiter: &[u8]) {
        self.line_buf = LineBuffer::new(delimiter);
    }

    /// Make subsequent `start` calls fail with `ConnectionFailed`, until
    /// called again with `false`.
    pub fn set_broken(&self, broken: bool) {
        if let Ok(mut rx) = self.rx.lock() {
            rx.broken = broken;
        }
        if let Ok(mut tx) = self.tx.lock() {
            tx.broken = broken;
        }
    }

    fn lock<'a>(
        shared: &'a Arc<Mutex<Shared>>,
    ) -> Result<std::sync::MutexGuard<'a, Shared>, LineIoError> {
        shared
            .lock()
            .map_err(|_| LineIoError::new(LineIoErrorKind::Io, "endpoint poisoned"))
    }
}

impl LineIo for MemEndpoint {
    fn start(&mut self) -> Result<(), LineIoError> {
        if Self::lock(&self.rx)?.broken {
            return Err(LineIoError::new(
                LineIoErrorKind::ConnectionFailed,
                "simulated connection failure",
            ));
        }
        self.active = true;
        Ok(())
    }

    fn close(&mut self) {
        self.active = false;
        self.line_buf.clear();
    }

    fn active(&self) -> bool {
        self.active
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LineIoError> {
        if !self.active {
            return Err(LineIoError::new(LineIoErrorKind::Closed, "not started"));
        }
        Self::lock(&self.tx)?.bytes.extend(data);
        Ok(())
    }

    fn read(&mut self) -> nb::Result<Vec<u8>, LineIoError> {
        if !self.active {
            return Err(nb::Error::Other(LineIoError::new(
                LineIoErrorKind::Closed,
                "not started",
            )));
        }
        {
            let mut rx = Self::lock(&self.rx).map_err(nb::Error::Other)?;
            if !rx.bytes.is_empty() {
                let (front, back) = rx.bytes.as_slices();
                self.line_buf.extend(front);
                self.line_buf.extend(back);
                rx.bytes.clear();
            }
        }
        self.line_buf.next_line().ok_or(nb::Error::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_full_duplex() {
        let (mut a, mut b) = MemEndpoint::pair(b"\r\n");
        a.start().unwrap();
        b.start().unwrap();

        a.write(b"ping\r\n").unwrap();
        b.write(b"pong\r\n").unwrap();

        assert_eq!(b.read().unwrap(), b"ping\r\n".to_vec());
        assert_eq!(a.read().unwrap(), b"pong\r\n".to_vec());
        assert!(matches!(a.read(), Err(nb::Error::WouldBlock)));
    }

    #[test]
    fn broken_endpoint_refuses_start() {
        let (mut a, _b) = MemEndpoint::pair(b"\r\n");
        a.set_broken(true);
        let err = a.start().unwrap_err();
        assert_eq!(err.kind, LineIoErrorKind::ConnectionFailed);
        a.set_broken(false);
        assert!(a.start().is_ok());
    }
}
