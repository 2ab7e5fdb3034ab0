//! Real-time scheduling for the breathing loop (Linux SCHED_FIFO, affinity
//! and mlockall; macOS mlockall only).
//!
//! Every step is best effort: a refusal is logged and the loop still runs.

use std::sync::OnceLock;

use crate::cli::RtLock;

#[derive(Debug, Clone, Copy)]
pub struct RtRequest {
    pub prio: Option<i32>,
    pub lock: RtLock,
    pub cpu: Option<usize>,
}

impl RtRequest {
    /// `lock` defaults to the OS default when not given.
    pub fn new(prio: Option<i32>, lock: Option<RtLock>, cpu: Option<usize>) -> Self {
        Self {
            prio,
            lock: lock.unwrap_or_else(RtLock::os_default),
            cpu,
        }
    }
}

static RT_ONCE: OnceLock<()> = OnceLock::new();

/// Apply `req` the first time it is called in this process.
pub fn setup_rt_once(req: RtRequest) {
    RT_ONCE.get_or_init(|| apply(req));
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn lock_memory(lock: RtLock) -> std::io::Result<()> {
    let flags = match lock {
        RtLock::None => return Ok(()),
        RtLock::Current => libc::MCL_CURRENT,
        RtLock::All => libc::MCL_CURRENT | libc::MCL_FUTURE,
    };
    // SAFETY: mlockall takes no pointers.
    let rc = unsafe { libc::mlockall(flags) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn is_memlock_refusal(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EPERM || code == libc::ENOMEM)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn apply_memory_lock(lock: RtLock) {
    match lock_memory(lock) {
        Ok(()) => tracing::info!(lock = ?lock, "memory locked"),
        // Future pages may exceed the memlock limit; resident ones often fit.
        Err(e) if lock == RtLock::All && is_memlock_refusal(&e) => {
            match lock_memory(RtLock::Current) {
                Ok(()) => tracing::warn!(error = %e, "mlockall(current|future) refused; locked current pages only"),
                Err(e2) => tracing::warn!(
                    error = %e2,
                    hint = "needs CAP_IPC_LOCK (or root) and a sufficient 'ulimit -l'",
                    "mlockall failed"
                ),
            }
        }
        Err(e) => tracing::warn!(
            error = %e,
            hint = "needs CAP_IPC_LOCK (or root) and a sufficient 'ulimit -l'",
            "mlockall failed"
        ),
    }
}

#[cfg(target_os = "linux")]
fn apply_fifo_priority(prio: Option<i32>) -> std::io::Result<i32> {
    // SAFETY: plain integer queries.
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    let (min, max) = if min < 0 || max < 0 { (1, 99) } else { (min, max) };
    let prio = prio.unwrap_or(max).clamp(min, max);
    let param = libc::sched_param {
        sched_priority: prio,
    };
    // SAFETY: `param` outlives the call.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        Ok(prio)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
fn apply_affinity(cpu: usize) -> eyre::Result<()> {
    let capacity = std::mem::size_of::<libc::cpu_set_t>() * 8;
    if cpu >= capacity {
        eyre::bail!("CPU {cpu} exceeds cpu_set_t capacity {capacity}");
    }
    // SAFETY: cpu_set_t is plain data; the CPU_* helpers stay within it
    // because `cpu` was checked against its capacity.
    unsafe {
        let mut allowed: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut allowed) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if !libc::CPU_ISSET(cpu, &allowed) {
            eyre::bail!("CPU {cpu} not permitted by current affinity mask");
        }
        let mut desired: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut desired);
        libc::CPU_SET(cpu, &mut desired);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &desired) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn apply(req: RtRequest) {
    apply_memory_lock(req.lock);
    match apply_fifo_priority(req.prio) {
        Ok(prio) => tracing::info!(prio, "SCHED_FIFO enabled"),
        Err(e) => tracing::warn!(
            error = %e,
            hint = "needs CAP_SYS_NICE or root",
            "sched_setscheduler(SCHED_FIFO) failed"
        ),
    }
    let cpu = req.cpu.unwrap_or(0);
    match apply_affinity(cpu) {
        Ok(()) => tracing::info!(cpu, "pinned to CPU"),
        Err(e) => tracing::warn!(error = %e, "affinity not applied"),
    }
}

#[cfg(target_os = "macos")]
fn apply(req: RtRequest) {
    apply_memory_lock(req.lock);
    tracing::warn!(
        prio = ?req.prio,
        cpu = ?req.cpu,
        "macOS has no SCHED_FIFO or affinity; only mlockall applied"
    );
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn apply(req: RtRequest) {
    tracing::warn!(?req, "real-time mode is not supported on this OS");
}
