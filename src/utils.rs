/// Returns the monotonic clock in milliseconds.
///
/// Heartbeats stored in the channel header use this timebase. It is
/// `CLOCK_MONOTONIC`, which is shared by all processes on the host, so a
/// timestamp written by a consumer can be aged by the producer.
#[cfg(unix)]
#[inline]
pub(crate) fn mono_time_ms() -> i64 {
    use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
    unsafe {
        let mut ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
        (ts.tv_sec as i64) * 1_000 + (ts.tv_nsec as i64) / 1_000_000
    }
}
