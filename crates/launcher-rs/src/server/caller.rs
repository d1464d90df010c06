//! Caller socket: one JSON request line per connection, one JSON reply line back

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;

use launcher_broker::{LaunchOutcome, Reply, ResolvedCommand};
use launcher_core::{LauncherError, Result};
use log::debug;
use serde::{Deserialize, Serialize};

/// Largest request line accepted from a caller
const MAX_REQUEST_LEN: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CallerRequest {
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: String,
        #[serde(default)]
        env: Vec<String>,
        #[serde(default)]
        startup_token: String,
        #[serde(default)]
        wait: bool,
    },
    ExecBlind {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<String>,
        #[serde(default)]
        startup_token: String,
    },
    StartService {
        command: ResolvedCommand,
        #[serde(default)]
        urls: Vec<String>,
        #[serde(default)]
        env: Vec<String>,
        #[serde(default)]
        startup_token: String,
        #[serde(default)]
        blind: bool,
    },
    /// A service name changed owner; an empty owner releases it
    ServiceRegistered {
        name: String,
        #[serde(default)]
        owner: String,
    },
    RequestWorker {
        protocol: String,
        #[serde(default)]
        host: String,
        app_socket: String,
    },
    SetEnv {
        name: String,
        value: String,
    },
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CallerReply {
    Outcome(LaunchOutcome),
    Worker { pid: i32 },
    Done,
    Failed { message: String },
}

/// Read the single request line of a caller connection. `None` when the
/// caller hung up without sending anything.
pub fn read_request(stream: &UnixStream) -> Result<Option<CallerRequest>> {
    let mut reader = BufReader::new(stream).take(MAX_REQUEST_LEN);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(LauncherError::Protocol(
            "request line not terminated".to_string(),
        ));
    }
    serde_json::from_str(&line)
        .map(Some)
        .map_err(|e| LauncherError::UnknownRequest(e.to_string()))
}

pub fn write_reply<W: Write>(writer: &mut W, reply: &CallerReply) -> Result<()> {
    let mut line = serde_json::to_vec(reply)
        .map_err(|e| LauncherError::Protocol(format!("encode reply: {}", e)))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Deferred launch reply that writes the outcome to `stream`
pub fn reply_to(stream: &UnixStream) -> Result<Reply> {
    let mut stream = stream.try_clone()?;
    Ok(Box::new(move |outcome| {
        if let Err(e) = write_reply(&mut stream, &CallerReply::Outcome(outcome)) {
            debug!("caller went away before its reply: {}", e);
        }
    }))
}
