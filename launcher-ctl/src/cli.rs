use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "launcher-ctl")]
#[command(version, about = "Launch and supervise programs for a desktop session", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Run the spawner with a supervised broker
    launcher-ctl spawner --with-broker

    # Launch through a running spawner and wait for the exit status
    launcher-ctl exec -- /bin/sh -c 'exit 3'
    launcher-ctl exec --no-wait --cwd /tmp xterm

    # Adjust the launch environment, then shut down
    launcher-ctl setenv LANG C.UTF-8
    launcher-ctl terminate
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Spawner control socket
    #[arg(short, long, value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the spawner in the foreground
    Spawner {
        /// Start a broker over a socketpair and restart it when it dies
        #[arg(long)]
        with_broker: bool,
    },

    /// Run the broker in the foreground
    Broker {
        /// Inherited spawner link (set by a supervising spawner)
        #[arg(long, value_name = "N")]
        fd: Option<i32>,

        /// Broker settings as JSON
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Caller socket
        #[arg(long, value_name = "PATH")]
        callers: Option<PathBuf>,

        /// Worker registration socket
        #[arg(long, value_name = "PATH")]
        workers: Option<PathBuf>,
    },

    /// Launch a program through the spawner
    Exec {
        /// Working directory of the program
        #[arg(long, value_name = "DIR")]
        cwd: Option<String>,

        /// Environment override (NAME=value), repeatable
        #[arg(short, long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,

        /// Startup notification token
        #[arg(long, value_name = "TOKEN")]
        startup_token: Option<String>,

        /// Print the pid and return without waiting for the exit
        #[arg(long)]
        no_wait: bool,

        /// Program to launch
        program: String,

        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Set a variable in the spawner's launch environment
    Setenv { name: String, value: String },

    /// Ask the spawner to shut down
    Terminate,
}
