use std::io::{Error, Result};

/// Checks whether a process exists without touching it.
pub fn process_alive(pid: u32) -> bool {
    // ESRCH means gone, EPERM still counts as alive.
    let r = unsafe { libc::kill(pid as _, 0) };
    r == 0 || Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn kill(pid: u32) -> Result<()> {
    let r = unsafe { libc::kill(pid as _, libc::SIGKILL) };
    if r == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
pub fn gettid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(target_os = "macos")]
pub fn gettid() -> u64 {
    let mut tid = 0u64;
    unsafe { libc::pthread_threadid_np(std::ptr::null_mut(), &mut tid) };
    tid
}

#[cfg(target_os = "linux")]
pub fn tgkill(tid: u64, sig: i32) -> Result<()> {
    let pid = unsafe { libc::getpid() };
    let r = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid as libc::pid_t, sig) };
    if r == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Raises the calling thread to the highest scheduling priority the OS
/// grants us. Failure is acceptable; the sampler still works, just with
/// more jitter.
pub fn raise_thread_priority() {
    unsafe {
        let thread = libc::pthread_self();
        let policy = libc::SCHED_FIFO;
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(policy);
        libc::pthread_setschedparam(thread, policy, &param);
    }
}
