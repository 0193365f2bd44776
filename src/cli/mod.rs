// CLI module - User-facing command-line interface

mod output;

use crate::error::{OverseerError, Result};
use crate::ipc::client::IpcClient;
use crate::ipc::protocol::{Command, LogRequest, LogStream, Response, Target};
use crate::ipc::DEFAULT_SOCKET_PATH;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Overseer - supervise long-running processes
#[derive(Parser, Debug)]
#[command(name = "overseer")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Daemon socket path
    #[arg(long, global = true, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start one declared process, or `all`
    Start { target: String },

    /// Stop one process, or `all`
    Stop { target: String },

    /// Restart every instance of a process
    Restart { name: String },

    /// Show managed processes
    Status { name: Option<String> },

    /// Re-read the configuration and apply the differences
    Reload {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Stop a process and forget it
    Delete { name: String },

    /// Print the tail of a process's log files
    Logs {
        name: String,

        /// Number of lines to display per file
        #[arg(short, long, default_value_t = 15)]
        lines: usize,

        /// Only the error log
        #[arg(long, conflicts_with = "out")]
        err: bool,

        /// Only the output log
        #[arg(long)]
        out: bool,
    },

    /// Check that the daemon answers
    Ping,
}

impl Cli {
    /// Parse arguments, talk to the daemon and return the process exit code
    pub fn run() -> i32 {
        let cli = Cli::parse();
        match cli.execute() {
            Ok(code) => code,
            Err(e) => {
                output::print_error(&e.to_string());
                if matches!(e, OverseerError::DaemonNotRunning) {
                    output::print_info("Start it with `overseerd --config <file>`");
                }
                e.kind().exit_code()
            }
        }
    }

    fn execute(&self) -> Result<i32> {
        let command = self.build_command()?;
        let client = IpcClient::with_socket_path(&self.socket);

        let response = match spinner_message(&command) {
            Some(message) => {
                let pb = output::create_progress_bar(&message);
                let response = client.send_command(command);
                pb.finish_and_clear();
                response?
            }
            None => client.send_command(command)?,
        };

        Ok(self.report(&response))
    }

    fn report(&self, response: &Response) -> i32 {
        match &response.result {
            Ok(data) => output::print_response(data),
            Err(error) => output::print_error(&error.message),
        }
        response.exit_code()
    }

    fn build_command(&self) -> Result<Command> {
        let command = match &self.command {
            Commands::Start { target } => Command::Start {
                target: Target::parse(target),
            },
            Commands::Stop { target } => Command::Stop {
                target: Target::parse(target),
            },
            Commands::Restart { name } => Command::Restart { name: name.clone() },
            Commands::Status { name } => Command::Status { name: name.clone() },
            Commands::Reload { config } => Command::Reload {
                // The daemon resolves paths against its own working directory
                config: config
                    .as_ref()
                    .map(|path| {
                        path.canonicalize().map_err(|e| {
                            OverseerError::InvalidConfig(format!(
                                "Cannot read {}: {}",
                                path.display(),
                                e
                            ))
                        })
                    })
                    .transpose()?,
            },
            Commands::Delete { name } => Command::Delete { name: name.clone() },
            Commands::Logs {
                name,
                lines,
                err,
                out,
            } => Command::Logs(LogRequest {
                name: name.clone(),
                lines: *lines,
                stream: match (err, out) {
                    (true, _) => Some(LogStream::Err),
                    (_, true) => Some(LogStream::Out),
                    _ => None,
                },
            }),
            Commands::Ping => Command::Ping,
        };
        Ok(command)
    }
}

/// Commands that wait on process termination get a spinner
fn spinner_message(command: &Command) -> Option<String> {
    match command {
        Command::Start { target } => Some(format!("Starting {}...", target)),
        Command::Stop { target } => Some(format!("Stopping {}...", target)),
        Command::Restart { name } => Some(format!("Restarting {}...", name)),
        Command::Delete { name } => Some(format!("Deleting {}...", name)),
        Command::Reload { .. } => Some("Reloading configuration...".to_string()),
        _ => None,
    }
}
