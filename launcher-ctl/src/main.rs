//! Launcher control CLI - run the spawner and broker, or talk to a running spawner

mod cli;
mod commands;
mod logging;

use clap::Parser;
use cli::{Cli, Commands};
use commands::{BrokerOptions, ExecOptions};
use console::style;
use launcher_rs::Result;

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Run the selected command and return the process exit code
fn run(cli: Cli) -> Result<i32> {
    let socket = commands::spawner_socket(cli.socket)?;

    match cli.command {
        Commands::Spawner { with_broker } => {
            commands::run_spawner(socket, with_broker, cli.verbose)?;
        }
        Commands::Broker {
            fd,
            config,
            callers,
            workers,
        } => {
            commands::run_broker(BrokerOptions {
                fd,
                config,
                spawner_socket: socket,
                callers,
                workers,
            })?;
        }
        Commands::Exec {
            cwd,
            env,
            startup_token,
            no_wait,
            program,
            args,
        } => {
            return commands::exec(
                &socket,
                ExecOptions {
                    program,
                    args,
                    env,
                    cwd,
                    startup_token,
                    wait: !no_wait,
                },
            );
        }
        Commands::Setenv { name, value } => commands::setenv(&socket, &name, &value)?,
        Commands::Terminate => commands::terminate(&socket)?,
    }
    Ok(0)
}
