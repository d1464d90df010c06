use std::fs::File;
use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use console::style;
use launcher_rs::util::default_socket_path;
use launcher_rs::{
    BrokerConfig, BrokerServer, ControlMessage, ExecRequest, LauncherError, Result,
    SPAWNER_SOCKET_NAME, ServerConfig, SpawnerConfig, SpawnerState, StreamLink, read_message,
    write_message,
};
use log::{debug, info};

/// Spawner socket from `--socket`, else the runtime default
pub fn spawner_socket(socket: Option<PathBuf>) -> Result<PathBuf> {
    match socket {
        Some(path) => Ok(path),
        None => default_socket_path(SPAWNER_SOCKET_NAME),
    }
}

pub fn run_spawner(socket: PathBuf, with_broker: bool, verbose: bool) -> Result<()> {
    let mut config = SpawnerConfig::new(socket);
    if with_broker {
        let program = std::env::current_exe()?.to_string_lossy().into_owned();
        let mut args = vec!["broker".to_string()];
        if verbose {
            args.push("--verbose".to_string());
        }
        config = config.broker(program, args);
    }

    let mut spawner = SpawnerState::new(config)?;
    if with_broker {
        let pid = spawner.start_broker()?;
        info!("supervising broker pid {}", pid);
    }
    spawner.run()
}

/// Where the broker finds its spawner and what it serves
pub struct BrokerOptions {
    pub fd: Option<i32>,
    pub config: Option<PathBuf>,
    pub spawner_socket: PathBuf,
    pub callers: Option<PathBuf>,
    pub workers: Option<PathBuf>,
}

pub fn load_broker_config(path: &Path) -> Result<BrokerConfig> {
    let file = File::open(path)?;
    let config: BrokerConfig = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| LauncherError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

pub fn run_broker(options: BrokerOptions) -> Result<()> {
    let broker = match &options.config {
        Some(path) => load_broker_config(path)?,
        None => BrokerConfig::default(),
    };

    let mut config = ServerConfig::default().broker(broker);
    if let Some(callers) = options.callers {
        config.caller_socket = callers;
    }
    if let Some(workers) = options.workers {
        config.worker_socket = workers;
    }

    let link = match options.fd {
        Some(fd) => StreamLink::from_inherited_fd(fd)?,
        None => StreamLink::connect(&options.spawner_socket)?,
    };
    let mut server = BrokerServer::new(config, link)?;
    server.run()
}

/// What `exec` asks the spawner for
pub struct ExecOptions {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub startup_token: Option<String>,
    pub wait: bool,
}

/// Launch through the spawner. Returns the exit status to exit with.
pub fn exec(socket: &Path, options: ExecOptions) -> Result<i32> {
    let mut request = ExecRequest::new(options.program, options.args);
    request.env = options.env;
    request.cwd = options.cwd.filter(|c| !c.is_empty());
    if let Some(token) = options.startup_token.as_deref() {
        request = request.with_startup_token(token);
    }
    request.validate()?;

    let mut stream = UnixStream::connect(socket)?;
    write_message(&mut stream, &ControlMessage::Exec(request))?;

    let pid = match read_message(&mut stream)? {
        Some(ControlMessage::Spawned { pid }) => pid,
        Some(ControlMessage::Error { message }) => {
            return Err(LauncherError::ExecFailed(
                message.unwrap_or_else(|| "launch failed".to_string()),
            ));
        }
        Some(other) => {
            return Err(LauncherError::Protocol(format!(
                "unexpected reply {:?}",
                other
            )));
        }
        None => return Err(LauncherError::ChannelClosed),
    };
    println!("{}={}", style("pid").dim(), style(pid).bold());
    if !options.wait {
        return Ok(0);
    }

    debug!("waiting for pid {}", pid);
    match read_message(&mut stream)? {
        Some(ControlMessage::ChildDied { pid: dead, status }) if dead == pid => {
            let styled = if status == 0 {
                style(status).green().bold()
            } else {
                style(status).red().bold()
            };
            println!("{}={}", style("exit_status").dim(), styled);
            Ok(status)
        }
        Some(other) => Err(LauncherError::Protocol(format!(
            "unexpected notice {:?}",
            other
        ))),
        None => Err(LauncherError::ChannelClosed),
    }
}

pub fn setenv(socket: &Path, name: &str, value: &str) -> Result<()> {
    if name.is_empty() || name.contains('=') {
        return Err(LauncherError::InvalidConfig(format!(
            "invalid variable name '{}'",
            name
        )));
    }
    let mut stream = UnixStream::connect(socket)?;
    write_message(
        &mut stream,
        &ControlMessage::SetEnv {
            name: name.to_string(),
            value: value.to_string(),
        },
    )
}

pub fn terminate(socket: &Path) -> Result<()> {
    let mut stream = UnixStream::connect(socket)?;
    write_message(&mut stream, &ControlMessage::Terminate)
}
