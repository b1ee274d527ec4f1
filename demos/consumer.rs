//! Tails a shared-memory video channel and reports frame metadata.
//!
//! Reads are zero-copy: the frame reference points straight into the
//! mapped ring slot and is only valid until the matching `release`.

use std::time::Duration;

use clap::Parser;
use nanobroker::{Consumer, OverflowPolicy, Settings};

#[path = "protocol.rs"]
mod protocol;
use protocol::{RING_SLOTS, VideoFrame};

#[derive(Parser, Debug)]
#[command(version, about = "Receives video frames from a shared-memory channel", long_about = None)]
struct Args {
    /// Topic name of the shared-memory channel.
    #[arg(short, long, default_value = protocol::TOPIC)]
    topic: String,

    /// Consumer slot id, unique per live consumer of the topic.
    #[arg(short, long, default_value_t = 0)]
    id: usize,

    /// Artificial processing delay per frame in milliseconds. Slower than
    /// the producer's rate forces gaps under the overwrite policy.
    #[arg(short, long, default_value_t = 0)]
    delay_ms: u64,
}

fn main() -> nanobroker::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let settings = Settings {
        overflow_policy: OverflowPolicy::OverwriteOld,
        ..Settings::default()
    };
    let mut rx = Consumer::<VideoFrame, RING_SLOTS>::attach(&args.topic, args.id, settings)?;
    println!("[consumer {}] attached to {:?}", args.id, args.topic);

    let mut last_id = 0u64;
    let mut received = 0u64;
    let mut dropped = 0u64;
    loop {
        let frame = rx.wait_and_peek()?;

        if last_id != 0 && frame.frame_id > last_id + 1 {
            dropped += frame.frame_id - last_id - 1;
        }
        last_id = frame.frame_id;
        received += 1;

        if received % 30 == 0 {
            println!(
                "[consumer {}] frame {} from producer {} ({}x{} {}), {} received, {} dropped",
                args.id,
                frame.frame_id,
                frame.producer_id,
                frame.width,
                frame.height,
                frame.format,
                received,
                dropped
            );
        }

        rx.release();
        if args.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(args.delay_ms));
        }
    }
}
