//! Producer, consumer, and admin roles over a shared channel.
//!
//! The producer runs `prepare_publish → fill → commit_publish`; consumers
//! run `peek → use → release`. The admin attaches in an inert mode that
//! performs no registration.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::layout::{Channel, MAX_CONSUMERS, SlotState};
use crate::mmap;
use crate::utils::mono_time_ms;

/// What the producer does when the next write would clobber a slot some
/// live consumer has not read yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// `prepare_publish` fails with "full"; the producer retries later.
    Block,
    /// The lagging consumer's tail is advanced past the slot. The consumer
    /// detects the lost slot through the sequence protocol.
    OverwriteOld,
}

/// Tuning knobs for a channel endpoint.
///
/// `producer_timeout_ms` is the heartbeat age beyond which a consumer
/// counts as dead; `spin_iterations` bounds busy-wait loops; the two
/// iteration counts together shape [`Consumer::wait_and_peek`]'s
/// spin → yield → sleep ladder.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub overflow_policy: OverflowPolicy,
    pub producer_timeout_ms: i64,
    pub spin_iterations: u32,
    pub yield_iterations: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            overflow_policy: OverflowPolicy::Block,
            producer_timeout_ms: 10_000,
            spin_iterations: 1_000,
            yield_iterations: 10_000,
        }
    }
}

/// Removes the shared-memory object behind `topic`.
///
/// Succeeds when the object does not exist. Mappings held by attached
/// processes stay valid until they unmap.
pub fn unlink(topic: &str) -> Result<()> {
    let name = mmap::segment_name(topic).map_err(|source| Error::OpenFailed {
        topic: topic.to_string(),
        source,
    })?;
    mmap::unlink_segment(&name).map_err(|source| Error::OpenFailed {
        topic: topic.to_string(),
        source,
    })
}

/// The writing end of a channel. Exactly one per topic.
///
/// Creating a producer unlinks any stale segment, creates a fresh one,
/// initializes the ring, and chooses a new random epoch. Records are
/// written in place: `prepare_publish` hands out a mutable view into the
/// head slot, `commit_publish` makes it visible to consumers.
///
/// The producer is intentionally **not `Clone`**: the ring has a single
/// writer.
pub struct Producer<T, const N: usize = 30> {
    chan: Channel<T, N>,
    settings: Settings,
    pending: bool,
}

impl<T: Copy, const N: usize> Producer<T, N> {
    /// Creates the segment for `topic` and becomes its owner.
    pub fn create(topic: &str, settings: Settings) -> Result<Self> {
        let chan = Channel::create(topic)?;
        Ok(Self {
            chan,
            settings,
            pending: false,
        })
    }

    /// Claims the head slot for writing and returns a mutable view of its
    /// record, or `None` when the ring is full under [`OverflowPolicy::Block`].
    ///
    /// Any registered consumer whose tail would be clobbered is checked
    /// first: if its heartbeat is older than `timeout_ms` it is evicted and
    /// ignored; otherwise the overflow policy decides between failing
    /// ("full") and advancing the consumer past the slot.
    ///
    /// The internal write lock is held until the matching
    /// [`commit_publish`](Self::commit_publish). Calling `prepare_publish`
    /// again before committing returns the same slot.
    pub fn prepare_publish(&mut self, timeout_ms: i64) -> Option<&mut T> {
        let header = self.chan.header();

        if !self.pending {
            while header.write_lock.swap(true, Ordering::Acquire) {
                std::hint::spin_loop();
            }

            let head = header.head.load(Ordering::Relaxed);
            let next_head = (head + 1) % N as u64;
            let now = mono_time_ms();

            for id in 0..MAX_CONSUMERS {
                if !header.slot_active[id].load(Ordering::Relaxed) {
                    continue;
                }
                let tail = header.tails[id].load(Ordering::Acquire);
                if tail != next_head {
                    continue;
                }

                let last = header.heartbeats[id].load(Ordering::Relaxed);
                if now - last > timeout_ms {
                    header.slot_active[id].store(false, Ordering::Release);
                    log::warn!(
                        "evicted consumer {} on {:?}: heartbeat {} ms old (limit {} ms)",
                        id,
                        self.chan.topic(),
                        now - last,
                        timeout_ms
                    );
                    continue;
                }

                match self.settings.overflow_policy {
                    OverflowPolicy::Block => {
                        header.write_lock.store(false, Ordering::Release);
                        return None;
                    }
                    OverflowPolicy::OverwriteOld => {
                        header.tails[id].store((tail + 1) % N as u64, Ordering::Release);
                    }
                }
            }

            self.chan
                .slot(head)
                .state
                .store(SlotState::Writing as u32, Ordering::Release);
            self.pending = true;
        }

        let head = self.chan.header().head.load(Ordering::Relaxed);
        Some(unsafe { &mut *self.chan.slot(head).data_ptr() })
    }

    /// Publishes the slot claimed by the last [`prepare_publish`](Self::prepare_publish)
    /// and advances the head. A no-op when nothing is pending.
    ///
    /// The sequence store is release-ordered before the state store, which
    /// is release-ordered before the head store: a consumer that observes
    /// the new head is guaranteed to see both.
    pub fn commit_publish(&mut self) {
        if !self.pending {
            return;
        }
        let header = self.chan.header();
        let head = header.head.load(Ordering::Relaxed);
        let slot = self.chan.slot(head);

        let seq = slot.sequence.load(Ordering::Relaxed);
        slot.sequence.store(seq + 1, Ordering::Release);
        slot.state.store(SlotState::Ready as u32, Ordering::Release);
        header.head.store((head + 1) % N as u64, Ordering::Release);
        header.write_lock.store(false, Ordering::Release);
        self.pending = false;
    }

    /// Copies `value` into the next slot and commits it. Returns `false`
    /// when the ring is full under [`OverflowPolicy::Block`], using
    /// `settings.producer_timeout_ms` as the dead-consumer limit.
    pub fn publish(&mut self, value: &T) -> bool {
        let timeout_ms = self.settings.producer_timeout_ms;
        match self.prepare_publish(timeout_ms) {
            Some(slot) => {
                *slot = *value;
                self.commit_publish();
                true
            }
            None => false,
        }
    }

    pub fn topic(&self) -> &str {
        self.chan.topic()
    }
}

impl<T, const N: usize> Drop for Producer<T, N> {
    fn drop(&mut self) {
        if self.pending {
            self.chan
                .header()
                .write_lock
                .store(false, Ordering::Release);
        }
    }
}

/// A registered reading end of a channel.
///
/// Consumer ids are assigned by the caller and must be unique among live
/// consumers of a topic; the channel does not arbitrate collisions. Each
/// `peek` and `release` refreshes the consumer's heartbeat — a consumer
/// that stops calling them is eventually evicted by the producer.
pub struct Consumer<T, const N: usize = 30> {
    chan: Channel<T, N>,
    id: usize,
    settings: Settings,
    epoch: u64,
}

impl<T: Copy, const N: usize> Consumer<T, N> {
    /// Attaches to `topic` and registers under `id`.
    ///
    /// The tail is seeded from the current head (a new consumer starts at
    /// the live edge, not at history) and the heartbeat is stamped before
    /// the active flag flips on, so the producer never observes a
    /// half-registered consumer.
    pub fn attach(topic: &str, id: usize, settings: Settings) -> Result<Self> {
        if id >= MAX_CONSUMERS {
            return Err(Error::InvalidConsumerId {
                id,
                max: MAX_CONSUMERS,
            });
        }
        let chan = Channel::attach(topic)?;
        let header = chan.header();
        let epoch = header.producer_epoch.load(Ordering::Acquire);

        let head = header.head.load(Ordering::Relaxed);
        header.tails[id].store(head, Ordering::Release);
        header.heartbeats[id].store(mono_time_ms(), Ordering::Release);
        header.slot_active[id].store(true, Ordering::Release);

        Ok(Self {
            chan,
            id,
            settings,
            epoch,
        })
    }

    /// Returns a read-only view of the next unread record, or `Ok(None)`
    /// when the ring holds nothing new for this consumer.
    ///
    /// The view stays valid until the next [`release`](Self::release);
    /// call `release` after every consumed view, or this consumer stalls
    /// and is eventually evicted.
    ///
    /// Fails with [`Error::Disconnected`] when the producer or the admin
    /// tool has cleared this consumer's registration.
    pub fn peek(&mut self) -> Result<Option<&T>> {
        Ok(self.peek_ptr()?.map(|p| unsafe { &*p }))
    }

    /// `peek` without forming a reference, so wait loops can retry while
    /// borrowing `self` again.
    fn peek_ptr(&mut self) -> Result<Option<*const T>> {
        let header = self.chan.header();

        let epoch = header.producer_epoch.load(Ordering::Acquire);
        if epoch != self.epoch {
            // Producer restarted: everything believed about the ring is
            // stale. Resync to the current head and report empty once.
            let head = header.head.load(Ordering::Acquire);
            header.tails[self.id].store(head, Ordering::Release);
            self.epoch = epoch;
            log::info!(
                "consumer {} on {:?}: producer restarted, resynced to slot {}",
                self.id,
                self.chan.topic(),
                head
            );
            return Ok(None);
        }

        if !header.slot_active[self.id].load(Ordering::Relaxed) {
            return Err(Error::Disconnected { id: self.id });
        }

        header.heartbeats[self.id].store(mono_time_ms(), Ordering::Relaxed);

        let tail = header.tails[self.id].load(Ordering::Relaxed);
        if tail == header.head.load(Ordering::Acquire) {
            return Ok(None);
        }

        let slot = self.chan.slot(tail);
        let seq_before = slot.sequence.load(Ordering::Acquire);

        let mut spin = 0u32;
        while slot.state.load(Ordering::Acquire) != SlotState::Ready as u32 {
            std::hint::spin_loop();
            spin += 1;
            if spin > self.settings.spin_iterations {
                // Writer still mid-flight; treat as transient.
                return Ok(None);
            }
        }

        let seq_after = slot.sequence.load(Ordering::Acquire);
        if seq_before != seq_after {
            // Lapped under OverwriteOld while reading: the slot is torn.
            // Skip it and let the caller retry.
            self.release();
            return Ok(None);
        }

        Ok(Some(slot.data_ptr() as *const T))
    }

    /// Releases the current view and advances this consumer's tail by one
    /// slot. Also refreshes the heartbeat.
    pub fn release(&mut self) {
        let header = self.chan.header();
        header.heartbeats[self.id].store(mono_time_ms(), Ordering::Relaxed);
        let tail = header.tails[self.id].load(Ordering::Relaxed);
        header.tails[self.id].store((tail + 1) % N as u64, Ordering::Release);
    }

    /// Blocks until a record is available and returns a view of it.
    ///
    /// Waits in three tiers: `spin_iterations` CPU-pause spins, then
    /// cooperative yields up to `yield_iterations`, then 1 µs sleeps.
    /// "Disconnected" propagates; empty results keep waiting.
    pub fn wait_and_peek(&mut self) -> Result<&T> {
        let mut spins = 0u32;
        loop {
            if let Some(p) = self.peek_ptr()? {
                return Ok(unsafe { &*p });
            }
            if spins < self.settings.spin_iterations {
                std::hint::spin_loop();
                spins += 1;
            } else if spins < self.settings.yield_iterations {
                thread::yield_now();
                spins += 1;
            } else {
                thread::sleep(Duration::from_micros(1));
            }
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn topic(&self) -> &str {
        self.chan.topic()
    }
}

impl<T, const N: usize> Drop for Consumer<T, N> {
    /// Deregisters the consumer. The segment itself stays alive.
    fn drop(&mut self) {
        self.chan.header().slot_active[self.id].store(false, Ordering::Release);
    }
}

/// Snapshot of a channel's header state, as collected by [`Admin::stats`].
#[derive(Clone, Debug)]
pub struct ChannelStats {
    pub topic: String,
    pub head: u64,
    pub producer_epoch: u64,
    pub capacity: u32,
    pub consumers: Vec<ConsumerStats>,
}

/// Per-consumer line of a stats snapshot.
#[derive(Clone, Debug)]
pub struct ConsumerStats {
    pub id: usize,
    pub tail: u64,
    /// Milliseconds since the consumer's last peek/release.
    pub heartbeat_age_ms: i64,
    /// Unread slots between this consumer's tail and the head.
    pub lag: u64,
}

/// Inert attachment for inspection and cleanup.
///
/// Performs no registration, never touches tails, and leaves no trace in
/// the header when dropped.
pub struct Admin<T, const N: usize = 30> {
    chan: Channel<T, N>,
}

impl<T: Copy, const N: usize> Admin<T, N> {
    pub fn attach(topic: &str) -> Result<Self> {
        Ok(Self {
            chan: Channel::attach(topic)?,
        })
    }

    /// Collects head position, epoch, and one entry per active consumer.
    pub fn stats(&self) -> ChannelStats {
        let header = self.chan.header();
        let head = header.head.load(Ordering::Relaxed);
        let now = mono_time_ms();

        let consumers = (0..MAX_CONSUMERS)
            .filter(|&id| header.slot_active[id].load(Ordering::Relaxed))
            .map(|id| {
                let tail = header.tails[id].load(Ordering::Relaxed);
                ConsumerStats {
                    id,
                    tail,
                    heartbeat_age_ms: now - header.heartbeats[id].load(Ordering::Relaxed),
                    lag: (head + N as u64 - tail) % N as u64,
                }
            })
            .collect();

        ChannelStats {
            topic: self.chan.topic().to_string(),
            head,
            producer_epoch: header.producer_epoch.load(Ordering::Relaxed),
            capacity: N as u32,
            consumers,
        }
    }

    /// Prints a human-readable stats table to stdout.
    pub fn print_stats(&self) {
        let stats = self.stats();
        println!("--- channel {:?} ---", stats.topic);
        println!("epoch: {:#018x}", stats.producer_epoch);
        println!("head:  {} / {} slots", stats.head, stats.capacity);
        for c in &stats.consumers {
            println!(
                "  [id {}] tail {} | lag {} | heartbeat {} ms ago",
                c.id, c.tail, c.lag, c.heartbeat_age_ms
            );
        }
        if stats.consumers.is_empty() {
            println!("  (no active consumers)");
        }
    }

    /// Clears consumer `id`'s registration. The next publish no longer
    /// considers its tail; the consumer itself sees "disconnected".
    pub fn force_disconnect(&self, id: usize) -> Result<()> {
        if id >= MAX_CONSUMERS {
            return Err(Error::InvalidConsumerId {
                id,
                max: MAX_CONSUMERS,
            });
        }
        self.chan.header().slot_active[id].store(false, Ordering::Release);
        log::info!(
            "force-disconnected consumer {} on {:?}",
            id,
            self.chan.topic()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_topic(prefix: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{}-{}-{}", prefix, std::process::id(), nanos)
    }

    struct Cleanup(String);
    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = unlink(&self.0);
        }
    }

    #[test]
    fn publish_then_peek_roundtrip() {
        let topic = unique_topic("broker-roundtrip");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        assert!(c.peek().unwrap().is_none(), "fresh consumer must be empty");

        let slot = p.prepare_publish(1_000).expect("ring cannot be full");
        *slot = 42;
        p.commit_publish();

        let view = c.peek().unwrap().expect("committed record must be visible");
        assert_eq!(*view, 42);
        c.release();
        assert!(c.peek().unwrap().is_none(), "released record must not repeat");
    }

    #[test]
    fn commit_without_prepare_is_a_noop() {
        let topic = unique_topic("broker-empty-commit");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        p.commit_publish();
        assert!(c.peek().unwrap().is_none(), "nothing must have been published");
    }

    #[test]
    fn prepare_twice_reuses_the_pending_slot() {
        let topic = unique_topic("broker-reprepare");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        *p.prepare_publish(1_000).unwrap() = 1;
        // A second prepare without a commit must not deadlock on the write
        // lock and must expose the same slot.
        *p.prepare_publish(1_000).unwrap() = 2;
        p.commit_publish();

        assert_eq!(*c.peek().unwrap().unwrap(), 2);
        c.release();
        assert!(c.peek().unwrap().is_none());
    }

    #[test]
    fn block_policy_reports_full() {
        let topic = unique_topic("broker-full");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        // N slots hold N-1 unread records before the next write would
        // clobber the consumer's tail.
        for v in 1..=3u64 {
            assert!(p.publish(&v), "publish {} must fit", v);
        }
        assert!(
            p.prepare_publish(10_000).is_none(),
            "fourth publish must report full"
        );

        assert_eq!(*c.peek().unwrap().unwrap(), 1);
        c.release();
        assert!(p.publish(&4), "publish must succeed after a release");
    }

    #[test]
    fn overwrite_policy_advances_lagging_consumer() {
        let topic = unique_topic("broker-overwrite");
        let _cleanup = Cleanup(topic.clone());
        let settings = Settings {
            overflow_policy: OverflowPolicy::OverwriteOld,
            ..Settings::default()
        };
        let mut p = Producer::<u64, 4>::create(&topic, settings).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, settings).unwrap();

        // Lap the consumer: 6 publishes into 4 slots.
        for v in 1..=6u64 {
            assert!(p.publish(&v), "overwrite publish must never fail");
        }

        // Only the newest N-1 records survive; the tail was pushed past
        // 1..=3 to make room.
        let first = *c.peek().unwrap().expect("data must be available");
        assert_eq!(first, 4);
        c.release();
        assert_eq!(*c.peek().unwrap().unwrap(), 5);
        c.release();
        assert_eq!(*c.peek().unwrap().unwrap(), 6);
        c.release();
        assert!(c.peek().unwrap().is_none());
    }

    #[test]
    fn stale_consumer_is_evicted_on_conflict() {
        let topic = unique_topic("broker-evict");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        // Age the heartbeat far past any timeout.
        let header = c.chan.header();
        header.heartbeats[0].store(mono_time_ms() - 60_000, Ordering::Relaxed);

        // Fill the ring; the conflicting publish evicts instead of blocking.
        for v in 1..=4u64 {
            assert!(p.publish(&v), "publish {} must succeed via eviction", v);
        }

        assert!(matches!(c.peek(), Err(Error::Disconnected { id: 0 })));
    }

    #[test]
    fn live_consumer_is_not_evicted() {
        let topic = unique_topic("broker-no-evict");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        for v in 1..=3u64 {
            assert!(p.publish(&v));
        }
        assert!(p.prepare_publish(10_000).is_none(), "must block, not evict");
        assert!(c.peek().unwrap().is_some(), "consumer must still be registered");
    }

    #[test]
    fn epoch_change_resyncs_once_then_delivers_new_records() {
        let topic = unique_topic("broker-epoch");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        assert!(p.publish(&7));

        // Simulate a producer restart re-initializing the mapping in place.
        let header = c.chan.header();
        let old = header.producer_epoch.load(Ordering::Acquire);
        header
            .producer_epoch
            .store(old.wrapping_add(1), Ordering::Release);

        assert!(
            c.peek().unwrap().is_none(),
            "first peek after an epoch change must report empty"
        );
        // The pre-restart record was discarded by the resync.
        assert!(c.peek().unwrap().is_none());

        assert!(p.publish(&8));
        assert_eq!(*c.peek().unwrap().unwrap(), 8);
    }

    #[test]
    fn peek_and_release_refresh_the_heartbeat() {
        let topic = unique_topic("broker-heartbeat");
        let _cleanup = Cleanup(topic.clone());
        let _p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        c.chan.header().heartbeats[0].store(0, Ordering::Relaxed);
        let _ = c.peek().unwrap();
        assert!(
            c.chan.header().heartbeats[0].load(Ordering::Relaxed) > 0,
            "peek must stamp the heartbeat"
        );

        c.chan.header().heartbeats[0].store(0, Ordering::Relaxed);
        c.release();
        assert!(
            c.chan.header().heartbeats[0].load(Ordering::Relaxed) > 0,
            "release must stamp the heartbeat"
        );
    }

    #[test]
    fn dropping_a_mid_prepare_producer_releases_the_write_lock() {
        let topic = unique_topic("broker-drop-lock");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let admin = Admin::<u64, 4>::attach(&topic).unwrap();

        let _ = p.prepare_publish(1_000).unwrap();
        drop(p);

        assert!(
            !admin.chan.header().write_lock.load(Ordering::Acquire),
            "write lock must be clear after the producer is dropped"
        );
    }

    #[test]
    fn consumer_drop_clears_registration() {
        let topic = unique_topic("broker-detach");
        let _cleanup = Cleanup(topic.clone());
        let _p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let admin = Admin::<u64, 4>::attach(&topic).unwrap();

        let c = Consumer::<u64, 4>::attach(&topic, 3, Settings::default()).unwrap();
        assert_eq!(admin.stats().consumers.len(), 1);
        drop(c);
        assert!(admin.stats().consumers.is_empty());
    }

    #[test]
    fn wait_and_peek_returns_published_record() {
        let topic = unique_topic("broker-wait");
        let _cleanup = Cleanup(topic.clone());
        let mut p = Producer::<u64, 4>::create(&topic, Settings::default()).unwrap();
        let mut c = Consumer::<u64, 4>::attach(&topic, 0, Settings::default()).unwrap();

        assert!(p.publish(&99));
        let view = c.wait_and_peek().unwrap();
        assert_eq!(*view, 99);
        c.release();
    }
}
