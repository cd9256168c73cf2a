//! Optional CPU pinning for the worker threads.

use tracing::{error, info};

/// Pin the calling thread to `core`. A `None` core is a no-op. Failure is
/// never fatal: latency-sensitive deployments pin, everything else runs
/// wherever the scheduler puts it.
///
/// Returns whether the thread ended up pinned (or the call was a no-op).
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: Option<usize>, name: &str) -> bool {
    let Some(core) = core else {
        return true;
    };

    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online > 0 && core >= online as usize {
        error!(
            thread = name,
            core,
            online,
            "cpu core out of range; thread left unpinned"
        );
        return false;
    }

    // pid 0 targets the calling thread.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        error!(
            thread = name,
            core,
            error = %std::io::Error::last_os_error(),
            "sched_setaffinity failed; thread left unpinned"
        );
        return false;
    }

    info!(thread = name, core, "cpu affinity set");
    true
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(core: Option<usize>, name: &str) -> bool {
    if let Some(core) = core {
        tracing::warn!(
            thread = name,
            core,
            "cpu pinning is not supported on this platform"
        );
        return false;
    }
    true
}
