//! Streams synthetic video frames into a shared-memory channel.
//!
//! Renders a moving bar directly into the ring slot returned by
//! `prepare_publish` — no staging buffer, no copy on the publish path.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use nanobroker::{OverflowPolicy, Producer, Settings};

#[path = "protocol.rs"]
mod protocol;
use protocol::{CHANNELS, MAX_HEIGHT, MAX_WIDTH, RING_SLOTS, VideoFrame};

#[derive(Parser, Debug)]
#[command(version, about = "Publishes synthetic video frames to a shared-memory channel", long_about = None)]
struct Args {
    /// Topic name of the shared-memory channel.
    #[arg(short, long, default_value = protocol::TOPIC)]
    topic: String,

    /// Frame period in milliseconds.
    #[arg(short, long, default_value_t = 33)]
    period_ms: u64,

    /// Number of frames to publish; 0 streams forever.
    #[arg(short = 'n', long, default_value_t = 0)]
    count: u64,

    /// Producer id stamped into each frame.
    #[arg(long, default_value_t = 0)]
    id: u32,
}

fn main() -> nanobroker::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let settings = Settings {
        overflow_policy: OverflowPolicy::OverwriteOld,
        ..Settings::default()
    };
    let mut tx = Producer::<VideoFrame, RING_SLOTS>::create(&args.topic, settings)?;
    println!(
        "[producer {}] streaming {}x{} frames on {:?} every {} ms",
        args.id, MAX_WIDTH, MAX_HEIGHT, args.topic, args.period_ms
    );

    let mut frame_id = 0u64;
    let mut bar_x = 0usize;
    loop {
        match tx.prepare_publish(2_000) {
            Some(frame) => {
                frame_id += 1;
                render_bar(frame, bar_x);
                bar_x = (bar_x + 5) % MAX_WIDTH;

                frame.producer_id = args.id;
                frame.frame_id = frame_id;
                frame.width = MAX_WIDTH as u32;
                frame.height = MAX_HEIGHT as u32;
                frame.channels = CHANNELS as u32;
                frame.data_len = (MAX_WIDTH * MAX_HEIGHT * CHANNELS) as u64;
                frame.format.set("BGR");
                frame.timestamp_ns = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);

                tx.commit_publish();
                if frame_id % 30 == 0 {
                    println!("[producer {}] sent frame {}", args.id, frame_id);
                }
            }
            None => {
                println!("[producer {}] ring full, waiting for consumers", args.id);
            }
        }

        if args.count != 0 && frame_id >= args.count {
            break;
        }
        std::thread::sleep(Duration::from_millis(args.period_ms));
    }

    println!("[producer {}] done after {} frames", args.id, frame_id);
    Ok(())
}

/// Paints a black frame with a white vertical bar at `bar_x`.
fn render_bar(frame: &mut VideoFrame, bar_x: usize) {
    frame.pixels.fill(0);
    for y in 0..MAX_HEIGHT {
        for x in bar_x..(bar_x + 10).min(MAX_WIDTH) {
            let at = (y * MAX_WIDTH + x) * CHANNELS;
            frame.pixels[at..at + CHANNELS].fill(0xFF);
        }
    }
}
