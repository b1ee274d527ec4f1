use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{Error, Result};
use crate::mmap::{self, SegmentError, ShmMapping};

/// Number of consumer slots in every channel header.
pub const MAX_CONSUMERS: usize = 16;

/// Sentinel proving a segment is a broadcast channel.
pub const MAGIC: u64 = u64::from_be_bytes(*b"NBROKER\x01");

/// Protocol version; attaching to a segment with a different version fails.
pub const VERSION: u32 = 1;

/// Slot lifecycle: `Free` (never written) → `Writing` → `Ready`, then
/// `Writing` again when the ring wraps onto the slot.
///
/// A reader may dereference the payload only after observing `Ready`
/// bracketed by two equal sequence reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Free = 0,
    Writing = 1,
    Ready = 2,
}

/// One ring cell: publication counter, tri-valued state, payload.
///
/// The sequence is incremented once per commit; a consumer that reads the
/// sequence, waits for `Ready`, and reads the sequence again knows the
/// payload bytes belong to exactly one publication iff the two reads are
/// equal.
///
/// The payload is `MaybeUninit` because a `Free` slot's bytes are whatever
/// `ftruncate` left there and are not a valid `T` yet.
#[repr(C, align(64))]
pub struct Slot<T> {
    pub sequence: AtomicU64,
    pub state: AtomicU32,
    data: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    /// Raw pointer to the payload. Callers synchronize through
    /// `sequence`/`state`; the producer writes through this pointer, and
    /// consumers read through it only after a `Ready` observation.
    #[inline(always)]
    pub fn data_ptr(&self) -> *mut T {
        self.data.get().cast()
    }
}

/// Channel header at offset 0 of the segment, shared by all processes.
///
/// `magic` is stored **last** during initialization with `Release`
/// ordering; attachers load it first with `Acquire` and only then trust
/// the remaining fields. Every frequently-written scalar sits on its own
/// cache line to avoid false sharing between the producer and consumers.
#[repr(C)]
pub struct ChannelHeader {
    /// [`MAGIC`], published last during initialization.
    pub magic: AtomicU64,
    /// [`VERSION`] of the channel protocol.
    pub version: u32,
    /// `size_of::<T>()` the producer was built against.
    pub struct_size: u32,
    /// Number of slots in the ring.
    pub buffer_capacity: u32,
    _reserved: u32,
    /// Random identifier chosen by the producer at creation. A change
    /// means the producer was restarted and the ring state is void.
    pub producer_epoch: AtomicU64,
    /// Next slot the producer will write.
    pub head: CachePadded<AtomicU64>,
    /// Per-consumer read cursors; consumer `i` reads `slots[tails[i]]` next.
    pub tails: [CachePadded<AtomicU64>; MAX_CONSUMERS],
    /// Whether consumer `i` is registered.
    pub slot_active: [CachePadded<AtomicBool>; MAX_CONSUMERS],
    /// Monotonic milliseconds of consumer `i`'s most recent peek/release.
    pub heartbeats: [CachePadded<AtomicI64>; MAX_CONSUMERS],
    /// Serializes the producer's prepare/commit pair against itself.
    pub write_lock: CachePadded<AtomicBool>,
}

/// Full segment image: header followed by the slot ring. Never constructed
/// by value; only viewed through a pointer into the mapping.
#[repr(C)]
pub struct SharedChannel<T, const N: usize> {
    pub header: ChannelHeader,
    pub slots: [Slot<T>; N],
}

/// An attached channel: the mapping plus a typed view of it.
///
/// `Channel` itself is role-agnostic; `Producer`, `Consumer`, and `Admin`
/// wrap it with the respective protocol.
pub struct Channel<T, const N: usize> {
    map: ShmMapping,
    topic: String,
    _marker: PhantomData<SharedChannel<T, N>>,
}

unsafe impl<T: Send, const N: usize> Send for Channel<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Channel<T, N> {}

impl<T, const N: usize> Channel<T, N> {
    const GEOMETRY_OK: () = assert!(
        N > 0 && N <= u32::MAX as usize,
        "slot count must fit the header's capacity field and be nonzero"
    );

    /// Creates a fresh segment for `topic` and initializes the header and
    /// all slots. Any stale segment with the same name is unlinked first.
    ///
    /// Used by the producer only.
    pub fn create(topic: &str) -> Result<Self> {
        let () = Self::GEOMETRY_OK;
        let name = mmap::segment_name(topic).map_err(|source| Error::OpenFailed {
            topic: topic.to_string(),
            source,
        })?;
        let map = mmap::create_segment(&name, size_of::<SharedChannel<T, N>>())
            .map_err(|e| segment_error(topic, e))?;
        let chan = Self {
            map,
            topic: topic.to_string(),
            _marker: PhantomData,
        };

        let ptr = chan.map.ptr().cast::<SharedChannel<T, N>>().as_ptr();
        unsafe {
            (*ptr).header.version = VERSION;
            (*ptr).header.struct_size = size_of::<T>() as u32;
            (*ptr).header.buffer_capacity = N as u32;
        }

        let shared = chan.shared();
        shared
            .header
            .producer_epoch
            .store(rand::random::<u64>(), Ordering::Relaxed);
        shared.header.head.store(0, Ordering::Relaxed);
        for i in 0..MAX_CONSUMERS {
            shared.header.tails[i].store(0, Ordering::Relaxed);
            shared.header.slot_active[i].store(false, Ordering::Relaxed);
            shared.header.heartbeats[i].store(0, Ordering::Relaxed);
        }
        shared.header.write_lock.store(false, Ordering::Relaxed);
        for slot in &shared.slots {
            slot.sequence.store(0, Ordering::Relaxed);
            slot.state.store(SlotState::Free as u32, Ordering::Relaxed);
        }
        shared.header.magic.store(MAGIC, Ordering::Release);

        log::debug!(
            "created channel {:?}: {} slots of {} record bytes",
            topic,
            N,
            size_of::<T>()
        );
        Ok(chan)
    }

    /// Attaches to an existing segment and validates it against the types
    /// this process was compiled with. The segment is left untouched on
    /// every failure path.
    pub fn attach(topic: &str) -> Result<Self> {
        let () = Self::GEOMETRY_OK;
        let name = mmap::segment_name(topic).map_err(|source| Error::OpenFailed {
            topic: topic.to_string(),
            source,
        })?;
        let (map, actual) = mmap::open_segment(&name, size_of::<ChannelHeader>())
            .map_err(|e| segment_error(topic, e))?;
        let chan = Self {
            map,
            topic: topic.to_string(),
            _marker: PhantomData,
        };

        let header = unsafe { chan.map.ptr().cast::<ChannelHeader>().as_ref() };
        let magic = header.magic.load(Ordering::Acquire);
        if magic != MAGIC {
            return Err(Error::StaleMemory {
                topic: topic.to_string(),
                found: magic,
            });
        }
        if header.version != VERSION {
            return Err(Error::VersionMismatch {
                topic: topic.to_string(),
                found: header.version,
                expected: VERSION,
            });
        }
        if header.struct_size as usize != size_of::<T>() {
            return Err(Error::LayoutMismatch {
                topic: topic.to_string(),
                field: "record size",
                found: header.struct_size as u64,
                expected: size_of::<T>() as u64,
            });
        }
        if header.buffer_capacity as usize != N {
            return Err(Error::LayoutMismatch {
                topic: topic.to_string(),
                field: "buffer capacity",
                found: header.buffer_capacity as u64,
                expected: N as u64,
            });
        }
        let expected = size_of::<SharedChannel<T, N>>();
        if actual < expected {
            return Err(Error::LayoutMismatch {
                topic: topic.to_string(),
                field: "segment size",
                found: actual as u64,
                expected: expected as u64,
            });
        }

        log::debug!("attached to channel {:?} ({} slots)", topic, N);
        Ok(chan)
    }

    #[inline(always)]
    pub fn shared(&self) -> &SharedChannel<T, N> {
        unsafe { self.map.ptr().cast::<SharedChannel<T, N>>().as_ref() }
    }

    #[inline(always)]
    pub fn header(&self) -> &ChannelHeader {
        &self.shared().header
    }

    #[inline(always)]
    pub fn slot(&self, index: u64) -> &Slot<T> {
        &self.shared().slots[index as usize]
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn segment_error(topic: &str, e: SegmentError) -> Error {
    match e {
        SegmentError::Open(source) => Error::OpenFailed {
            topic: topic.to_string(),
            source,
        },
        SegmentError::Map(source) => Error::MapFailed {
            topic: topic.to_string(),
            source,
        },
        // An object too small to hold a header cannot be a channel.
        SegmentError::TooSmall(_) => Error::StaleMemory {
            topic: topic.to_string(),
            found: 0,
        },
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

    fn cleanup(topic: &str) {
        let name = mmap::segment_name(topic).unwrap();
        mmap::unlink_segment(&name).unwrap();
    }

    #[test]
    fn slot_is_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<Slot<u64>>(), 64);
        assert_eq!(size_of::<Slot<u64>>() % 64, 0);
    }

    #[test]
    fn slots_start_right_after_header() {
        assert_eq!(
            std::mem::offset_of!(SharedChannel<u64, 4>, slots),
            size_of::<ChannelHeader>()
        );
    }

    #[test]
    fn header_size_is_stable_across_record_types() {
        assert_eq!(
            std::mem::offset_of!(SharedChannel<u64, 4>, slots),
            std::mem::offset_of!(SharedChannel<[u8; 1024], 8>, slots)
        );
    }

    #[test]
    fn create_initializes_ring() {
        let topic = unique_topic("layout-init");
        let chan = Channel::<u64, 4>::create(&topic).unwrap();
        let shared = chan.shared();

        assert_eq!(shared.header.magic.load(Ordering::Acquire), MAGIC);
        assert_eq!(shared.header.version, VERSION);
        assert_eq!(shared.header.struct_size, 8);
        assert_eq!(shared.header.buffer_capacity, 4);
        assert_eq!(shared.header.head.load(Ordering::Relaxed), 0);
        for i in 0..MAX_CONSUMERS {
            assert!(!shared.header.slot_active[i].load(Ordering::Relaxed));
            assert_eq!(shared.header.tails[i].load(Ordering::Relaxed), 0);
        }
        for slot in &shared.slots {
            assert_eq!(slot.sequence.load(Ordering::Relaxed), 0);
            assert_eq!(
                slot.state.load(Ordering::Relaxed),
                SlotState::Free as u32
            );
        }

        drop(chan);
        cleanup(&topic);
    }

    #[test]
    fn attach_missing_segment_is_open_failed() {
        let topic = unique_topic("layout-missing");
        assert!(matches!(
            Channel::<u64, 4>::attach(&topic),
            Err(Error::OpenFailed { .. })
        ));
    }

    #[test]
    fn attach_zeroed_segment_is_stale_memory() {
        let topic = unique_topic("layout-stale");
        let name = mmap::segment_name(&topic).unwrap();
        // A zero-filled object of plausible size: magic reads as 0.
        let raw = mmap::create_segment(&name, size_of::<SharedChannel<u64, 4>>()).unwrap();
        assert!(matches!(
            Channel::<u64, 4>::attach(&topic),
            Err(Error::StaleMemory { found: 0, .. })
        ));
        drop(raw);
        cleanup(&topic);
    }

    #[test]
    fn attach_tiny_object_is_stale_memory() {
        let topic = unique_topic("layout-tiny");
        let name = mmap::segment_name(&topic).unwrap();
        let raw = mmap::create_segment(&name, 64).unwrap();
        assert!(matches!(
            Channel::<u64, 4>::attach(&topic),
            Err(Error::StaleMemory { .. })
        ));
        drop(raw);
        cleanup(&topic);
    }

    #[test]
    fn attach_wrong_version_is_version_mismatch() {
        let topic = unique_topic("layout-version");
        let chan = Channel::<u64, 4>::create(&topic).unwrap();
        unsafe {
            let ptr = chan.map.ptr().cast::<ChannelHeader>().as_ptr();
            (*ptr).version = VERSION + 1;
        }
        assert!(matches!(
            Channel::<u64, 4>::attach(&topic),
            Err(Error::VersionMismatch { found, .. }) if found == VERSION + 1
        ));
        drop(chan);
        cleanup(&topic);
    }

    #[test]
    fn attach_wrong_record_size_is_layout_mismatch() {
        let topic = unique_topic("layout-record");
        let chan = Channel::<u64, 4>::create(&topic).unwrap();
        assert!(matches!(
            Channel::<[u8; 64], 4>::attach(&topic),
            Err(Error::LayoutMismatch {
                field: "record size",
                found: 8,
                expected: 64,
                ..
            })
        ));
        drop(chan);
        cleanup(&topic);
    }

    #[test]
    fn attach_wrong_capacity_is_layout_mismatch() {
        let topic = unique_topic("layout-capacity");
        let chan = Channel::<u64, 4>::create(&topic).unwrap();
        assert!(matches!(
            Channel::<u64, 8>::attach(&topic),
            Err(Error::LayoutMismatch {
                field: "buffer capacity",
                ..
            })
        ));
        drop(chan);
        cleanup(&topic);
    }

    #[test]
    fn attach_valid_segment_succeeds() {
        let topic = unique_topic("layout-ok");
        let chan = Channel::<u64, 4>::create(&topic).unwrap();
        let other = Channel::<u64, 4>::attach(&topic).unwrap();
        assert_eq!(
            other.header().producer_epoch.load(Ordering::Acquire),
            chan.header().producer_epoch.load(Ordering::Acquire)
        );
        drop(other);
        drop(chan);
        cleanup(&topic);
    }

    #[test]
    fn fresh_create_replaces_stale_segment() {
        let topic = unique_topic("layout-replace");
        let old = Channel::<u64, 4>::create(&topic).unwrap();
        let old_epoch = old.header().producer_epoch.load(Ordering::Acquire);

        // A second create unlinks the stale object and starts a new epoch.
        let new = Channel::<u64, 4>::create(&topic).unwrap();
        let new_epoch = new.header().producer_epoch.load(Ordering::Acquire);
        assert_ne!(old_epoch, new_epoch);

        drop(old);
        drop(new);
        cleanup(&topic);
    }
}
