//! # NanoBroker — zero-copy broadcast bus over shared memory
//!
//! A **single-producer / multi-consumer** broadcast channel for moving
//! fixed-layout records (for example video frames of several megabytes)
//! between unrelated processes on one host, with zero copies through the
//! publish path: the producer writes records directly into mapped shared
//! memory, and consumers observe the same bytes through views into that
//! mapping.
//!
//! # Features
//!
//! * **Lock-free** publish and read paths over POSIX shared memory
//! * **Sequence + state handshake** so readers detect slot reuse without
//!   locks, even under the overwrite policy
//! * **Per-consumer tails** — up to 16 registered consumers, each reading
//!   at its own pace
//! * **Heartbeat-driven eviction** — a frozen consumer never blocks the
//!   producer for longer than a configurable timeout
//! * **Producer-restart recovery** — a random per-producer epoch lets
//!   consumers detect re-initialization and resynchronize
//! * **Cache-friendly** layout (every shared scalar on its own cache line)
//! * Zero allocations after attachment
//!
//! # Roles
//!
//! * [`Producer`] creates the segment and runs `prepare_publish → fill →
//!   commit_publish`.
//! * [`Consumer`] attaches under a caller-chosen id and runs `peek → use →
//!   release`; [`Consumer::wait_and_peek`] adds a spin → yield → sleep
//!   wait ladder.
//! * [`Admin`] attaches inertly for [`Admin::stats`],
//!   [`Admin::force_disconnect`], and cleanup via [`unlink`].
//!
//! Records must be trivially relocatable (`Copy`, no heap pointers).
//! Inline text fields use [`FixedStr`].
//!
//! # Quick example
//!
//! ```ignore
//! use nanobroker::{Consumer, Producer, Settings};
//!
//! #[derive(Clone, Copy)]
//! #[repr(C)]
//! struct Sample { frame_id: u64, value: f64 }
//!
//! // producer process
//! let mut tx = Producer::<Sample, 30>::create("telemetry", Settings::default())?;
//! if let Some(slot) = tx.prepare_publish(2_000) {
//!     slot.frame_id = 1;
//!     slot.value = 0.5;
//!     tx.commit_publish();
//! }
//!
//! // consumer process
//! let mut rx = Consumer::<Sample, 30>::attach("telemetry", 0, Settings::default())?;
//! if let Some(sample) = rx.peek()? {
//!     println!("frame {}", sample.frame_id);
//! }
//! rx.release();
//! ```
//!
//! # Overflow policies
//!
//! When the next write would clobber a slot a live consumer has not read
//! yet, [`Settings::overflow_policy`] decides:
//!
//! * [`OverflowPolicy::Block`] — `prepare_publish` reports "full" and the
//!   producer retries. A consumer that keeps up sees every record in
//!   publication order with no gaps.
//! * [`OverflowPolicy::OverwriteOld`] — the lagging consumer's tail is
//!   pushed past the slot. The consumer observes a gapped but strictly
//!   ordered subsequence and never a torn payload: each slot carries a
//!   sequence counter read before and after the payload, and a mismatch
//!   means the slot was overwritten mid-read and must be skipped.
//!
//! # Liveness
//!
//! No operation blocks on a wait primitive held by another process. The
//! producer's progress never depends on any single consumer: a consumer
//! whose heartbeat (refreshed by its own `peek`/`release` calls) grows
//! older than the publish timeout is evicted on the spot.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

mod layout;
mod mmap;
mod utils;

pub mod broker;
pub mod error;
pub mod text;

pub use broker::{
    Admin, ChannelStats, Consumer, ConsumerStats, OverflowPolicy, Producer, Settings, unlink,
};
pub use error::{Error, Result};
pub use layout::MAX_CONSUMERS;
pub use text::FixedStr;
