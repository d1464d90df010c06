//! Worker registration socket
//!
//! Workers speak a line protocol. A worker announces `HOLD <url>` and
//! `TEMPAUTH` first when they apply, then `IDLE <pid> <protocol> [host]`.
//! The broker answers `CONNECT <app_socket>` when it hands the worker on.

use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use launcher_broker::{CapabilityKey, IdleWorker, WorkerConnection};
use launcher_core::{LauncherError, Result};
use log::debug;
use nix::unistd::Pid;

/// Longest line a worker may send
const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    Idle { pid: Pid, key: CapabilityKey },
    Hold { url: String },
    TempAuth,
}

pub fn parse_line(line: &str) -> Result<WorkerLine> {
    let mut words = line.split_whitespace();
    let bad = || LauncherError::Protocol(format!("bad worker line '{}'", line));
    match words.next() {
        Some("IDLE") => {
            let pid: i32 = words.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
            if pid <= 0 {
                return Err(bad());
            }
            let protocol = words.next().ok_or_else(bad)?;
            let host = words.next().unwrap_or("");
            Ok(WorkerLine::Idle {
                pid: Pid::from_raw(pid),
                key: CapabilityKey::new(protocol, host),
            })
        }
        Some("HOLD") => {
            let url = words.next().ok_or_else(bad)?;
            Ok(WorkerLine::Hold {
                url: url.to_string(),
            })
        }
        Some("TEMPAUTH") => Ok(WorkerLine::TempAuth),
        _ => Err(bad()),
    }
}

/// Pooled side of a worker connection
#[derive(Debug)]
pub struct WorkerHandle {
    stream: UnixStream,
}

impl WorkerConnection for WorkerHandle {
    fn hand_over(&mut self, app_socket: &str) -> Result<()> {
        writeln!(self.stream, "CONNECT {}", app_socket)?;
        self.stream.flush()?;
        Ok(())
    }
}

/// A connected worker as seen by the server loop
#[derive(Debug)]
pub struct WorkerPeer {
    stream: UnixStream,
    buffer: Vec<u8>,
    pub pid: Option<Pid>,
    held_url: Option<String>,
    temp_auth: bool,
}

impl WorkerPeer {
    pub fn new(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            buffer: Vec::new(),
            pid: None,
            held_url: None,
            temp_auth: false,
        })
    }

    /// Complete lines received so far. `None` once the worker hung up.
    pub fn read_lines(&mut self) -> Result<Option<Vec<String>>> {
        let mut chunk = [0u8; 1024];
        let mut closed = false;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut lines = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line[..end]).into_owned());
        }
        if self.buffer.len() > MAX_LINE_LEN {
            return Err(LauncherError::Protocol("worker line too long".to_string()));
        }
        if closed && lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(lines))
    }

    /// Apply one line. Returns the worker to pool when it reported idle.
    pub fn apply(&mut self, line: WorkerLine) -> Result<Option<IdleWorker<WorkerHandle>>> {
        match line {
            WorkerLine::Hold { url } => self.held_url = Some(url),
            WorkerLine::TempAuth => self.temp_auth = true,
            WorkerLine::Idle { pid, key } => {
                self.pid = Some(pid);
                let handle = WorkerHandle {
                    stream: self.stream.try_clone()?,
                };
                let mut worker =
                    IdleWorker::new(pid, key, handle).temp_auth(std::mem::take(&mut self.temp_auth));
                worker.held_url = self.held_url.take();
                return Ok(Some(worker));
            }
        }
        Ok(None)
    }

    /// Close the connection for every holder of the socket
    pub fn disconnect(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("worker shutdown: {}", e);
        }
    }
}

impl AsRawFd for WorkerPeer {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
