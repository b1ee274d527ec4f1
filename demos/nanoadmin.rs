//! Inspection and cleanup tool for a shared-memory video channel.
//!
//! Attaches in the inert mode: no consumer registration, no tail writes.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nanobroker::{Admin, unlink};

#[path = "protocol.rs"]
mod protocol;
use protocol::{RING_SLOTS, VideoFrame};

#[derive(Parser, Debug)]
#[command(version, about = "Administers a shared-memory video channel", long_about = None)]
struct Args {
    /// Topic name of the shared-memory channel.
    #[arg(short, long, default_value = protocol::TOPIC)]
    topic: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Shows head position and active consumers with heartbeat ages.
    Stats,

    /// Forcefully clears a consumer registration.
    Kick {
        /// Consumer slot id to disconnect.
        id: usize,
    },

    /// Deletes the shared-memory object. Fixes a producer that refuses to
    /// start over a stale segment.
    Clean,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("(is the producer running? stats and kick need the segment to exist)");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> nanobroker::Result<()> {
    match args.command {
        Commands::Clean => unlink(&args.topic),
        Commands::Stats => {
            Admin::<VideoFrame, RING_SLOTS>::attach(&args.topic)?.print_stats();
            Ok(())
        }
        Commands::Kick { id } => {
            Admin::<VideoFrame, RING_SLOTS>::attach(&args.topic)?.force_disconnect(id)
        }
    }
}
