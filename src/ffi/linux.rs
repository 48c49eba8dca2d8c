use std::cell::UnsafeCell;
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::mem::MaybeUninit;
use std::time::Duration;

/// POSIX semaphore usable from a signal handler (`sem_post` is
/// async-signal-safe, which is the whole point).
pub struct Sem(UnsafeCell<libc::sem_t>);

// The inner sem_t is only ever touched through sem_* calls.
unsafe impl Send for Sem {}
unsafe impl Sync for Sem {}

impl Sem {
    pub fn new() -> Result<Self> {
        let mut sem = MaybeUninit::<libc::sem_t>::uninit();
        let r = unsafe { libc::sem_init(sem.as_mut_ptr(), 0, 0) };
        if r != 0 {
            return Err(Error::last_os_error());
        }
        Ok(Sem(UnsafeCell::new(unsafe { sem.assume_init() })))
    }

    pub fn post(&self) {
        unsafe { libc::sem_post(self.0.get()) };
    }

    /// Waits up to `timeout`; `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut now = MaybeUninit::<libc::timespec>::uninit();
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, now.as_mut_ptr()) };
        let now = unsafe { now.assume_init() };

        let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        let abs = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: (nanos % 1_000_000_000) as _,
        };
        loop {
            let r = unsafe { libc::sem_timedwait(self.0.get(), &abs) };
            if r == 0 {
                return true;
            }
            match Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return false,
            }
        }
    }

    /// Non-blocking drain of any stale posts.
    pub fn drain(&self) {
        while unsafe { libc::sem_trywait(self.0.get()) } == 0 {}
    }
}

impl Drop for Sem {
    fn drop(&mut self) {
        unsafe { libc::sem_destroy(self.0.get()) };
    }
}

/// Reads one word of our own address space through `process_vm_readv`,
/// which reports EFAULT on unmapped pages instead of crashing. Stack walks
/// cross guard pages on corrupt frame chains; this keeps them survivable.
pub fn vm_read_word(addr: u64) -> Option<u64> {
    let mut out = 0u64;
    let local = libc::iovec {
        iov_base: &mut out as *mut u64 as *mut _,
        iov_len: 8,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut _,
        iov_len: 8,
    };
    let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    (n == 8).then_some(out)
}

/// One row of `/proc/self/task/<tid>/stat`.
#[derive(Clone, Debug)]
pub struct TaskStat {
    pub name: String,
    pub state: char,
    /// utime + stime, in nanoseconds.
    pub cpu_ns: u64,
}

pub fn list_tids() -> Result<Vec<u64>> {
    let mut tids = Vec::new();
    for entry in fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<u64>() {
            tids.push(tid);
        }
    }
    Ok(tids)
}

pub fn task_stat(tid: u64) -> Result<TaskStat> {
    let raw = fs::read_to_string(format!("/proc/self/task/{tid}/stat"))?;
    parse_stat(&raw)
}

// The comm field may contain spaces and parentheses; everything after the
// closing paren is space-separated.
fn parse_stat(raw: &str) -> Result<TaskStat> {
    let open = raw.find('(').ok_or(ErrorKind::InvalidData)?;
    let close = raw.rfind(')').ok_or(ErrorKind::InvalidData)?;
    let name = raw[open + 1..close].to_string();
    let rest: Vec<&str> = raw[close + 1..].split_ascii_whitespace().collect();
    // rest[0] = state; rest[11] = utime, rest[12] = stime (fields 14/15).
    if rest.len() < 13 {
        return Err(ErrorKind::InvalidData.into());
    }
    let state = rest[0].chars().next().ok_or(ErrorKind::InvalidData)?;
    let utime: u64 = rest[11].parse().map_err(|_| ErrorKind::InvalidData)?;
    let stime: u64 = rest[12].parse().map_err(|_| ErrorKind::InvalidData)?;
    let tick_ns = 1_000_000_000 / unsafe { libc::sysconf(libc::_SC_CLK_TCK) as u64 };
    Ok(TaskStat {
        name,
        state,
        cpu_ns: (utime + stime) * tick_ns,
    })
}

#[cfg(test)]
mod test {
    use super::parse_stat;

    #[test]
    fn parse_stat_with_spaces_in_comm() {
        let raw = "1234 (tokio runtime w) S 1 1 1 0 -1 4194304 100 0 0 0 25 13 0 0 20 0 1 0 100 0 0";
        let stat = parse_stat(raw).unwrap();
        assert_eq!(stat.name, "tokio runtime w");
        assert_eq!(stat.state, 'S');
        assert!(stat.cpu_ns > 0);
    }
}
