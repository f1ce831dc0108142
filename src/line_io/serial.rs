//! Unix serial-port transport, plus the pseudo-terminal used to stand in
//! for a modem in tests and simulators.
//!
//! The port is opened non-blocking and configured raw; framing is done in
//! userspace by [`LineBuffer`]. DTR is driven with the modem-control
//! ioctls, which the Iridium driver uses to hang up a call.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use log::debug;
use nix::libc;
use nix::sys::termios::{self, BaudRate, SetArg};

use super::{LineBuffer, LineIo, LineIoError, LineIoErrorKind};

fn baud_rate(baud: u32) -> BaudRate {
    match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _ => BaudRate::B9600,
    }
}

fn make_raw<F: AsFd>(fd: &F, baud: Option<u32>) -> Result<(), LineIoError> {
    let mut tio = termios::tcgetattr(fd)
        .map_err(|e| LineIoError::new(LineIoErrorKind::ConnectionFailed, e.to_string()))?;
    termios::cfmakeraw(&mut tio);
    if let Some(baud) = baud {
        termios::cfsetispeed(&mut tio, baud_rate(baud))
            .map_err(|e| LineIoError::new(LineIoErrorKind::ConnectionFailed, e.to_string()))?;
        termios::cfsetospeed(&mut tio, baud_rate(baud))
            .map_err(|e| LineIoError::new(LineIoErrorKind::ConnectionFailed, e.to_string()))?;
    }
    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)
        .map_err(|e| LineIoError::new(LineIoErrorKind::ConnectionFailed, e.to_string()))
}

fn set_dtr_fd(raw_fd: i32, state: bool) -> Result<(), LineIoError> {
    let mut bits: libc::c_int = 0;
    // SAFETY: TIOCMGET/TIOCMSET read/write a single int for an open tty fd
    let rc = unsafe { libc::ioctl(raw_fd, libc::TIOCMGET, &mut bits) };
    if rc == -1 {
        return Err(LineIoError::new(
            LineIoErrorKind::Io,
            std::io::Error::last_os_error().to_string(),
        ));
    }
    if state {
        bits |= libc::TIOCM_DTR;
    } else {
        bits &= !libc::TIOCM_DTR;
    }
    let rc = unsafe { libc::ioctl(raw_fd, libc::TIOCMSET, &bits) };
    if rc == -1 {
        return Err(LineIoError::new(
            LineIoErrorKind::Io,
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

/// A raw, non-blocking serial port.
#[derive(Debug)]
pub struct SerialIo {
    port: String,
    baud: u32,
    file: Option<File>,
    line_buf: LineBuffer,
}

impl SerialIo {
    pub fn new(port: String, baud: u32, delimiter: &[u8]) -> Self {
        SerialIo {
            port,
            baud,
            file: None,
            line_buf: LineBuffer::new(delimiter),
        }
    }
}

impl LineIo for SerialIo {
    fn start(&mut self) -> Result<(), LineIoError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(&self.port)
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?;
        make_raw(&file, Some(self.baud))?;
        debug!("opened serial port {} at {} baud", self.port, self.baud);
        self.file = Some(file);
        self.line_buf.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
        self.line_buf.clear();
    }

    fn active(&self) -> bool {
        self.file.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LineIoError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| LineIoError::new(LineIoErrorKind::Closed, "port not open"))?;
        file.write_all(data)
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::Io, e))
    }

    fn read(&mut self) -> nb::Result<Vec<u8>, LineIoError> {
        let file = self.file.as_mut().ok_or_else(|| {
            nb::Error::Other(LineIoError::new(LineIoErrorKind::Closed, "port not open"))
        })?;
        let mut chunk = [0u8; 4096];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.line_buf.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(nb::Error::Other(LineIoError::from_io(
                        LineIoErrorKind::Io,
                        e,
                    )));
                }
            }
        }
        self.line_buf.next_line().ok_or(nb::Error::WouldBlock)
    }

    fn set_dtr(&mut self, state: bool) -> Result<(), LineIoError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| LineIoError::new(LineIoErrorKind::Closed, "port not open"))?;
        debug!("setting DTR {}", if state { "high" } else { "low" });
        set_dtr_fd(file.as_raw_fd(), state)
    }
}

/// Master side of a pseudo-terminal pair. A simulator holds the `PtyIo`;
/// the driver under test opens the slave path as an ordinary
/// [`SerialIo`].
#[derive(Debug)]
pub struct PtyIo {
    master: OwnedFd,
    // held open so reads on the master do not error before the peer opens
    _slave: OwnedFd,
    slave_path: PathBuf,
    line_buf: LineBuffer,
    active: bool,
}

impl PtyIo {
    pub fn open(delimiter: &[u8]) -> Result<PtyIo, LineIoError> {
        let pty = nix::pty::openpty(None, None)
            .map_err(|e| LineIoError::new(LineIoErrorKind::ConnectionFailed, e.to_string()))?;
        make_raw(&pty.master, None)?;
        make_raw(&pty.slave, None)?;
        nix::fcntl::fcntl(
            pty.master.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .map_err(|e| LineIoError::new(LineIoErrorKind::ConnectionFailed, e.to_string()))?;
        let slave_path = nix::unistd::ttyname(pty.slave.as_fd())
            .map_err(|e| LineIoError::new(LineIoErrorKind::ConnectionFailed, e.to_string()))?;
        Ok(PtyIo {
            master: pty.master,
            _slave: pty.slave,
            slave_path,
            line_buf: LineBuffer::new(delimiter),
            active: false,
        })
    }

    /// Path a peer should open to talk to this pty.
    pub fn slave_path(&self) -> &PathBuf {
        &self.slave_path
    }
}

impl LineIo for PtyIo {
    fn start(&mut self) -> Result<(), LineIoError> {
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
            return Err(LineIoError::new(LineIoErrorKind::Closed, "pty closed"));
        }
        let mut remaining = data;
        while !remaining.is_empty() {
            match nix::unistd::write(self.master.as_fd(), remaining) {
                Ok(n) => remaining = &remaining[n..],
                Err(nix::errno::Errno::EAGAIN) => break, // best effort
                Err(e) => return Err(LineIoError::new(LineIoErrorKind::Io, e.to_string())),
            }
        }
        Ok(())
    }

    fn read(&mut self) -> nb::Result<Vec<u8>, LineIoError> {
        if !self.active {
            return Err(nb::Error::Other(LineIoError::new(
                LineIoErrorKind::Closed,
                "pty closed",
            )));
        }
        let mut chunk = [0u8; 4096];
        loop {
            match nix::unistd::read(self.master.as_raw_fd(), &mut chunk) {
                Ok(0) => break,
                Ok(n) => self.line_buf.extend(&chunk[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(nb::Error::Other(LineIoError::new(
                        LineIoErrorKind::Io,
                        e.to_string(),
                    )));
                }
            }
        }
        self.line_buf.next_line().ok_or(nb::Error::WouldBlock)
    }
}
