//! Typed control messages and their payload schemas

use std::io::{Read, Write};

use launcher_core::{LauncherError, Result};

use crate::frame::Frame;
use crate::payload::{PayloadReader, PayloadWriter};

/// Wire command codes
pub mod command {
    pub const EXEC: u32 = 1;
    pub const SETENV: u32 = 2;
    pub const CHILD_DIED: u32 = 3;
    pub const OK: u32 = 4;
    pub const ERROR: u32 = 5;
    pub const SHELL: u32 = 6;
    pub const TERMINATE: u32 = 8;
    pub const DEBUG_WAIT: u32 = 9;
    pub const EXT_EXEC: u32 = 10;
    pub const WRAPPER: u32 = 11;
    pub const EXEC_NEW: u32 = 12;
}

/// Human-readable command name for logs
pub fn command_name(code: u32) -> &'static str {
    match code {
        command::EXEC => "EXEC",
        command::SETENV => "SETENV",
        command::CHILD_DIED => "CHILD_DIED",
        command::OK => "OK",
        command::ERROR => "ERROR",
        command::SHELL => "SHELL",
        command::TERMINATE => "TERMINATE",
        command::DEBUG_WAIT => "DEBUG_WAIT",
        command::EXT_EXEC => "EXT_EXEC",
        command::WRAPPER => "WRAPPER",
        command::EXEC_NEW => "EXEC_NEW",
        _ => "UNKNOWN",
    }
}

/// Flavours of the launch command. Each one fixes which optional fields follow
/// `argc, name, args...` and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecVariant {
    /// Nothing after the arguments
    Exec,
    /// envc, envs, avoid_loops, [cwd]
    #[default]
    ExecNew,
    /// envc, envs, avoid_loops, startup token, [cwd]
    ExtExec,
    /// cwd, envc, envs, avoid_loops, startup token; environment reset
    Shell,
    /// cwd, envc, envs, tty, avoid_loops, startup token; environment reset
    Wrapper,
}

impl ExecVariant {
    pub fn command(self) -> u32 {
        match self {
            ExecVariant::Exec => command::EXEC,
            ExecVariant::ExecNew => command::EXEC_NEW,
            ExecVariant::ExtExec => command::EXT_EXEC,
            ExecVariant::Shell => command::SHELL,
            ExecVariant::Wrapper => command::WRAPPER,
        }
    }

    pub fn from_command(code: u32) -> Option<Self> {
        match code {
            command::EXEC => Some(ExecVariant::Exec),
            command::EXEC_NEW => Some(ExecVariant::ExecNew),
            command::EXT_EXEC => Some(ExecVariant::ExtExec),
            command::SHELL => Some(ExecVariant::Shell),
            command::WRAPPER => Some(ExecVariant::Wrapper),
            _ => None,
        }
    }

    /// Shell and wrapper launches start from an empty environment
    pub fn resets_env(self) -> bool {
        matches!(self, ExecVariant::Shell | ExecVariant::Wrapper)
    }

    fn leading_cwd(self) -> bool {
        matches!(self, ExecVariant::Shell | ExecVariant::Wrapper)
    }

    fn trailing_cwd(self) -> bool {
        matches!(self, ExecVariant::ExecNew | ExecVariant::ExtExec)
    }

    fn carries_env(self) -> bool {
        !matches!(self, ExecVariant::Exec)
    }

    fn carries_token(self) -> bool {
        matches!(
            self,
            ExecVariant::ExtExec | ExecVariant::Shell | ExecVariant::Wrapper
        )
    }

    fn carries_tty(self) -> bool {
        matches!(self, ExecVariant::Wrapper)
    }
}

/// Payload of a launch command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecRequest {
    pub variant: ExecVariant,
    pub program: String,
    pub args: Vec<String>,
    /// `NAME=value` overrides, later entries win
    pub env: Vec<String>,
    pub avoid_loops: bool,
    pub startup_token: Option<String>,
    pub cwd: Option<String>,
    pub tty: Option<String>,
}

impl ExecRequest {
    /// Plain launch of `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    /// Attach a startup token. `""` and `"0"` clear it.
    pub fn with_startup_token(mut self, token: &str) -> Self {
        self.startup_token =
            launcher_core::util::is_startup_token(token).then(|| token.to_string());
        if self.startup_token.is_some() && self.variant == ExecVariant::ExecNew {
            self.variant = ExecVariant::ExtExec;
        }
        self
    }

    /// Check that every populated field can be carried by the chosen variant
    pub fn validate(&self) -> Result<()> {
        let v = self.variant;
        if self.program.is_empty() {
            return Err(LauncherError::Protocol("empty program name".to_string()));
        }
        if !v.carries_env() && (!self.env.is_empty() || self.avoid_loops) {
            return Err(LauncherError::Protocol(format!(
                "{:?} cannot carry environment or avoid_loops",
                v
            )));
        }
        if !v.carries_token() && self.startup_token.is_some() {
            return Err(LauncherError::Protocol(format!(
                "{:?} cannot carry a startup token",
                v
            )));
        }
        if !v.carries_tty() && self.tty.is_some() {
            return Err(LauncherError::Protocol(format!("{:?} cannot carry a tty", v)));
        }
        if !(v.leading_cwd() || v.trailing_cwd()) && self.cwd.is_some() {
            return Err(LauncherError::Protocol(format!(
                "{:?} cannot carry a working directory",
                v
            )));
        }
        if let Some(token) = &self.startup_token {
            if !launcher_core::util::is_startup_token(token) {
                return Err(LauncherError::Protocol(format!(
                    "{:?} is not a startup token",
                    token
                )));
            }
        }
        if self.cwd.as_deref() == Some("") || self.tty.as_deref() == Some("") {
            return Err(LauncherError::Protocol(
                "empty cwd/tty must be expressed as None".to_string(),
            ));
        }
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let v = self.variant;
        let mut w = PayloadWriter::new();
        w.put_long(self.args.len() as i64 + 1);
        w.put_str(&self.program)?;
        for arg in &self.args {
            w.put_str(arg)?;
        }
        if v.leading_cwd() {
            w.put_str(self.cwd.as_deref().unwrap_or(""))?;
        }
        if v.carries_env() {
            w.put_long(self.env.len() as i64);
            for entry in &self.env {
                w.put_str(entry)?;
            }
        }
        if v.carries_tty() {
            w.put_str(self.tty.as_deref().unwrap_or(""))?;
        }
        if v.carries_env() {
            w.put_long(i64::from(self.avoid_loops));
        }
        if v.carries_token() {
            w.put_str(self.startup_token.as_deref().unwrap_or("0"))?;
        }
        if v.trailing_cwd() {
            if let Some(cwd) = &self.cwd {
                w.put_str(cwd)?;
            }
        }
        Ok(w.finish())
    }

    fn decode(variant: ExecVariant, payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let argc = r.get_long()?;
        if argc < 1 || argc as usize > payload.len() {
            return Err(LauncherError::Protocol(format!("invalid argc {}", argc)));
        }
        let program = r.get_str()?;
        let mut args = Vec::with_capacity(argc as usize - 1);
        for _ in 1..argc {
            args.push(r.get_str()?);
        }

        let mut request = ExecRequest {
            variant,
            program,
            args,
            ..Default::default()
        };

        if variant.leading_cwd() {
            request.cwd = non_empty(r.get_str()?);
        }
        if variant.carries_env() {
            let envc = r.get_long()?;
            if envc < 0 || envc as usize > payload.len() {
                return Err(LauncherError::Protocol(format!("invalid envc {}", envc)));
            }
            for _ in 0..envc {
                request.env.push(r.get_str()?);
            }
        }
        if variant.carries_tty() {
            request.tty = non_empty(r.get_str()?);
        }
        if variant.carries_env() {
            request.avoid_loops = r.get_long()? != 0;
        }
        if variant.carries_token() {
            let token = r.get_str()?;
            request.startup_token = launcher_core::util::is_startup_token(&token).then_some(token);
        }
        if variant.trailing_cwd() && r.remaining() > 0 {
            request.cwd = non_empty(r.get_str()?);
        }
        r.finish()?;
        Ok(request)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Everything that travels over a control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Launch a program (any EXEC variant)
    Exec(ExecRequest),
    /// Set a variable in the spawner's launch environment
    SetEnv { name: String, value: String },
    /// Broker handshake: OK without payload
    Ready,
    /// Launch succeeded: OK carrying the pid
    Spawned { pid: i32 },
    /// Launch failed, with an optional reason
    Error { message: Option<String> },
    /// A tracked child terminated with a normalized status
    ChildDied { pid: i32, status: i32 },
    /// Graceful shutdown request
    Terminate,
    /// Suspend the next launched child before exec
    DebugWait,
}

impl ControlMessage {
    pub fn command(&self) -> u32 {
        match self {
            ControlMessage::Exec(req) => req.variant.command(),
            ControlMessage::SetEnv { .. } => command::SETENV,
            ControlMessage::Ready | ControlMessage::Spawned { .. } => command::OK,
            ControlMessage::Error { .. } => command::ERROR,
            ControlMessage::ChildDied { .. } => command::CHILD_DIED,
            ControlMessage::Terminate => command::TERMINATE,
            ControlMessage::DebugWait => command::DEBUG_WAIT,
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        let payload = match self {
            ControlMessage::Exec(req) => req.encode()?,
            ControlMessage::SetEnv { name, value } => {
                if name.is_empty() || name.contains('=') {
                    return Err(LauncherError::Protocol(format!(
                        "invalid variable name {:?}",
                        name
                    )));
                }
                let mut w = PayloadWriter::new();
                w.put_str(name)?;
                w.put_str(value)?;
                w.finish()
            }
            ControlMessage::Ready | ControlMessage::Terminate | ControlMessage::DebugWait => {
                Vec::new()
            }
            ControlMessage::Spawned { pid } => {
                let mut w = PayloadWriter::new();
                w.put_long(i64::from(*pid));
                w.finish()
            }
            ControlMessage::Error { message } => match message {
                Some(text) => {
                    let mut w = PayloadWriter::new();
                    w.put_str(text)?;
                    w.finish()
                }
                None => Vec::new(),
            },
            ControlMessage::ChildDied { pid, status } => {
                let mut w = PayloadWriter::new();
                w.put_long(i64::from(*pid));
                w.put_long(i64::from(*status));
                w.finish()
            }
        };
        Ok(Frame::new(self.command(), payload))
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        if let Some(variant) = ExecVariant::from_command(frame.command) {
            return Ok(ControlMessage::Exec(ExecRequest::decode(
                variant,
                &frame.payload,
            )?));
        }

        let mut r = PayloadReader::new(&frame.payload);
        let message = match frame.command {
            command::SETENV => {
                let name = r.get_str()?;
                let value = r.get_str()?;
                if name.is_empty() {
                    return Err(LauncherError::Protocol("SETENV with empty name".to_string()));
                }
                ControlMessage::SetEnv { name, value }
            }
            command::OK if frame.payload.is_empty() => ControlMessage::Ready,
            command::OK => ControlMessage::Spawned {
                pid: to_i32(r.get_long()?, "pid")?,
            },
            command::ERROR if frame.payload.is_empty() => ControlMessage::Error { message: None },
            command::ERROR => ControlMessage::Error {
                message: Some(r.get_str()?),
            },
            command::CHILD_DIED => {
                let pid = to_i32(r.get_long()?, "pid")?;
                let status = to_i32(r.get_long()?, "exit status")?;
                ControlMessage::ChildDied { pid, status }
            }
            command::TERMINATE => ControlMessage::Terminate,
            command::DEBUG_WAIT => ControlMessage::DebugWait,
            other => {
                return Err(LauncherError::Protocol(format!("unknown command {}", other)));
            }
        };
        r.finish()?;
        Ok(message)
    }
}

fn to_i32(value: i64, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| LauncherError::Protocol(format!("{} {} out of range", what, value)))
}

/// Read and decode one message; `Ok(None)` on clean EOF
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Option<ControlMessage>> {
    match Frame::read_from(reader)? {
        Some(frame) => ControlMessage::decode(&frame).map(Some),
        None => Ok(None),
    }
}

/// Encode and write one message
pub fn write_message<W: Write + ?Sized>(writer: &mut W, message: &ControlMessage) -> Result<()> {
    message.encode()?.write_to(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(message: ControlMessage) {
        let frame = message.encode().unwrap();
        let bytes = frame.to_bytes().unwrap();
        let decoded = read_message(&mut Cursor::new(&bytes)).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.encode().unwrap().to_bytes().unwrap(), bytes);
    }

    fn full_request(variant: ExecVariant) -> ExecRequest {
        let mut req = ExecRequest::new("/usr/bin/editor", vec!["a.txt".into(), "".into()]);
        req.variant = variant;
        if variant != ExecVariant::Exec {
            req.env = vec!["LANG=C".into(), "X=1".into()];
            req.avoid_loops = true;
            req.cwd = Some("/tmp".into());
        }
        if matches!(
            variant,
            ExecVariant::ExtExec | ExecVariant::Shell | ExecVariant::Wrapper
        ) {
            req.startup_token = Some("host;1;2_TIME3".into());
        }
        if variant == ExecVariant::Wrapper {
            req.tty = Some("/dev/pts/3".into());
        }
        req
    }

    #[test]
    fn every_command_round_trips() {
        for variant in [
            ExecVariant::Exec,
            ExecVariant::ExecNew,
            ExecVariant::ExtExec,
            ExecVariant::Shell,
            ExecVariant::Wrapper,
        ] {
            round_trip(ControlMessage::Exec(full_request(variant)));
        }
        round_trip(ControlMessage::SetEnv {
            name: "DISPLAY".into(),
            value: ":0".into(),
        });
        round_trip(ControlMessage::Ready);
        round_trip(ControlMessage::Spawned { pid: 4242 });
        round_trip(ControlMessage::Error { message: None });
        round_trip(ControlMessage::Error {
            message: Some("exec failed".into()),
        });
        round_trip(ControlMessage::ChildDied { pid: 7, status: 143 });
        round_trip(ControlMessage::Terminate);
        round_trip(ControlMessage::DebugWait);
    }

    #[test]
    fn exec_new_without_cwd_omits_trailing_field() {
        let mut req = full_request(ExecVariant::ExecNew);
        req.cwd = None;
        let frame = ControlMessage::Exec(req.clone()).encode().unwrap();
        let decoded = ControlMessage::decode(&frame).unwrap();
        assert_eq!(decoded, ControlMessage::Exec(req));
    }

    #[test]
    fn plain_exec_rejects_env() {
        let mut req = ExecRequest::new("ls", Vec::new());
        req.variant = ExecVariant::Exec;
        req.env.push("A=1".into());
        assert!(ControlMessage::Exec(req).encode().is_err());
    }

    #[test]
    fn startup_token_upgrades_variant() {
        let req = ExecRequest::new("app", Vec::new()).with_startup_token("id_1");
        assert_eq!(req.variant, ExecVariant::ExtExec);
        let none = ExecRequest::new("app", Vec::new()).with_startup_token("0");
        assert_eq!(none.variant, ExecVariant::ExecNew);
        assert!(none.startup_token.is_none());
    }

    #[test]
    fn extra_bytes_after_exec_fields_are_rejected() {
        let mut req = ExecRequest::new("ls", Vec::new());
        req.variant = ExecVariant::Exec;
        let mut frame = ControlMessage::Exec(req).encode().unwrap();
        frame.payload.extend_from_slice(b"junk\0");
        assert!(matches!(
            ControlMessage::decode(&frame),
            Err(LauncherError::Protocol(_))
        ));
    }

    #[test]
    fn argc_larger_than_strings_is_rejected() {
        let mut w = PayloadWriter::new();
        w.put_long(3);
        w.put_str("ls").unwrap();
        let frame = Frame::new(command::EXEC, w.finish());
        assert!(ControlMessage::decode(&frame).is_err());
    }

    #[test]
    fn setenv_requires_exact_length() {
        let mut payload = b"NAME\0value\0".to_vec();
        payload.push(b'x');
        let frame = Frame::new(command::SETENV, payload);
        assert!(ControlMessage::decode(&frame).is_err());
    }

    #[test]
    fn unknown_command_is_protocol_error() {
        let frame = Frame::new(99, Vec::new());
        assert!(matches!(
            ControlMessage::decode(&frame),
            Err(LauncherError::Protocol(_))
        ));
    }

    #[test]
    fn ok_payload_of_wrong_size_is_rejected() {
        let frame = Frame::new(command::OK, vec![1, 2, 3]);
        assert!(ControlMessage::decode(&frame).is_err());
    }

    #[test]
    fn command_names() {
        assert_eq!(command_name(command::CHILD_DIED), "CHILD_DIED");
        assert_eq!(command_name(1000), "UNKNOWN");
    }
}
