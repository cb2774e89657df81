use std::error::Error;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use clap::{Parser, Subcommand};
use padlink::ExecutionMode;
use padlink::core::logging::init_logger;

mod encode;
mod run;
mod simulate;

#[derive(Parser)]
#[command(
    name = "padlink",
    version,
    about = "Run Lua scripts against TCP light/button pads"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a device and run a script
    Run {
        /// Lua script to run
        script: PathBuf,
        /// Device host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Device port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Config file (default: <config dir>/Padlink/padlink.yaml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// process or thread
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Restart the script when the file changes
        #[arg(long, default_value_t = false)]
        watch: bool,
        /// Print host events as JSON lines
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Pads shown by the `board` command
        #[arg(long, default_value_t = 16)]
        pads: usize,
    },
    /// Pretend to be a pad device
    Simulate {
        /// Port to listen on
        #[arg(long, default_value_t = 5000)]
        port: u16,
        /// Number of pads, addressed from 0
        #[arg(long, default_value_t = 16)]
        pads: usize,
        /// Pads per printed row
        #[arg(long, default_value_t = 4)]
        columns: usize,
    },
    /// Print the bytes of a color command
    Encode {
        #[command(subcommand)]
        command: encode::EncodeCommand,
    },
    /// Script host process, started by `run`
    #[command(hide = true)]
    Runner { server_name: String },
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logger();

    match Cli::parse().command {
        Command::Run {
            script,
            host,
            port,
            config,
            mode,
            watch,
            json,
            pads,
        } => run::run(run::RunArgs {
            script,
            host,
            port,
            config,
            mode,
            watch,
            json,
            pads,
        }),
        Command::Simulate {
            port,
            pads,
            columns,
        } => simulate::simulate(port, pads, columns),
        Command::Encode { command } => encode::encode(command),
        Command::Runner { server_name } => {
            padlink::sandbox::runner::run_child(server_name)
        }
    }
}

/// Lines typed on stdin. The channel closes at EOF.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn parse_addr(token: Option<&str>) -> Result<u8, String> {
    let token = token.ok_or("missing address")?;
    token
        .parse::<u8>()
        .map_err(|err| format!("invalid address '{}': {}", token, err))
}
