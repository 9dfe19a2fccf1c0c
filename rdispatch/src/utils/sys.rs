use std::sync::OnceLock;
use std::thread;

/// Number of CPUs this process may run on. Drives `apply` fan-out.
pub(crate) fn active_cpu_count() -> usize {
    static CPUS: OnceLock<usize> = OnceLock::new();
    *CPUS.get_or_init(|| thread::available_parallelism().map_or(1, |n| n.get()))
}

/// Spin-loop hint for the short windows where another thread is known to be
/// in the middle of publishing a pointer.
#[inline(always)]
pub(crate) fn relax() {
    std::hint::spin_loop();
}
