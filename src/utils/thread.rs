#[cfg(target_os = "linux")]
use crate::runtime::hardware_concurrency;

/// Pins the current thread to the given core, modulo the number of cores
/// actually present. Affinity is best effort; failures are ignored.
#[cfg(target_os = "linux")]
pub(crate) fn pin_to_core(core: usize) {
    let num_cores = hardware_concurrency();

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % num_cores, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pin_to_core(_core: usize) {}
