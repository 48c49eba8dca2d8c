//! Linux backend: signal handshake.
//!
//! There is no per-thread suspend on Linux, so the sampler parks the target
//! inside a signal handler instead: it sends SIGPROF with `tgkill`, the
//! handler copies its register context into a fixed slot, posts `ack` and
//! blocks on `resume`. The time the target spends blocked in the handler is
//! the suspend window; posting `resume` is the resume operation and happens
//! on every exit path, timeout included.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use super::unwind;
use super::{PeerThread, RunState, SampleError};
use crate::ffi::linux::{self, Sem};
use crate::ffi::syscall;

pub struct ThreadHandle(u64);

const ACK_TIMEOUT: Duration = Duration::from_millis(10);

struct Slot {
    target_tid: AtomicU64,
    fp: AtomicU64,
    lr: AtomicU64,
    sp: AtomicU64,
    ack: Sem,
    resume: Sem,
}

static SLOT: OnceLock<Slot> = OnceLock::new();

fn slot() -> &'static Slot {
    SLOT.get_or_init(|| {
        install_handler();
        Slot {
            target_tid: AtomicU64::new(0),
            fp: AtomicU64::new(0),
            lr: AtomicU64::new(0),
            sp: AtomicU64::new(0),
            ack: Sem::new().expect("sem_init"),
            resume: Sem::new().expect("sem_init"),
        }
    })
}

fn install_handler() {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = handler as usize;
        act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaction(libc::SIGPROF, &act, std::ptr::null_mut());
    }
}

// Runs on the sampled thread. Everything here must be async-signal-safe:
// atomics, sem_post, sem_wait, and nothing else.
extern "C" fn handler(_sig: i32, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let Some(slot) = SLOT.get() else { return };
    if syscall::gettid() != slot.target_tid.load(Ordering::Acquire) {
        // Stale or foreign SIGPROF; not our handshake.
        return;
    }
    let uc = ctx as *const libc::ucontext_t;
    let (fp, lr, sp) = unsafe { context_registers(&*uc) };
    slot.fp.store(fp, Ordering::Relaxed);
    slot.lr.store(lr, Ordering::Relaxed);
    slot.sp.store(sp, Ordering::Relaxed);
    slot.ack.post();
    // Parked until the sampler is done walking our stack.
    while !slot.resume.wait_timeout(Duration::from_millis(100)) {
        if syscall::gettid() != slot.target_tid.load(Ordering::Acquire) {
            // Sampler gave up on us and moved on.
            break;
        }
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn context_registers(uc: &libc::ucontext_t) -> (u64, u64, u64) {
    let gregs = &uc.uc_mcontext.gregs;
    let fp = gregs[libc::REG_RBP as usize] as u64;
    let sp = gregs[libc::REG_RSP as usize] as u64;
    // No link register on x86: the instruction pointer seeds the walk and
    // the return addresses come out of the frame records.
    let pc = gregs[libc::REG_RIP as usize] as u64;
    (fp, pc, sp)
}

#[cfg(target_arch = "aarch64")]
unsafe fn context_registers(uc: &libc::ucontext_t) -> (u64, u64, u64) {
    let mc = &uc.uc_mcontext;
    (mc.regs[29], mc.regs[30], mc.sp)
}

pub fn list_peers() -> io::Result<Vec<PeerThread>> {
    let mut peers = Vec::new();
    for tid in linux::list_tids()? {
        let Ok(stat) = linux::task_stat(tid) else {
            // Exited between readdir and the stat read.
            continue;
        };
        peers.push(PeerThread {
            tid,
            name: (!stat.name.is_empty()).then(|| stat.name.clone()),
            run_state: if stat.state == 'R' {
                RunState::Running
            } else {
                RunState::Waiting
            },
            idle: matches!(stat.state, 'Z' | 'X' | 'I'),
            cpu_ns: stat.cpu_ns,
            handle: ThreadHandle(tid),
        });
    }
    Ok(peers)
}

/// Parks the peer in the signal handler, walks its stack, releases it.
///
/// Pairing invariant: every handshake posts `resume` exactly once, on the
/// success path and on the ack-timeout path alike.
pub fn sample_thread(peer: &PeerThread, scratch: &mut Vec<u64>) -> Result<(), SampleError> {
    let slot = slot();
    slot.ack.drain();
    slot.resume.drain();
    slot.target_tid.store(peer.handle.0, Ordering::Release);

    if syscall::tgkill(peer.handle.0, libc::SIGPROF).is_err() {
        slot.target_tid.store(0, Ordering::Release);
        return Err(SampleError::Suspend);
    }

    if !slot.ack.wait_timeout(ACK_TIMEOUT) {
        // The handler may still fire later; release it either way so the
        // peer can never stay parked.
        slot.target_tid.store(0, Ordering::Release);
        slot.resume.post();
        return Err(SampleError::Suspend);
    }

    let fp = slot.fp.load(Ordering::Relaxed);
    let lr = slot.lr.load(Ordering::Relaxed);
    let sp = slot.sp.load(Ordering::Relaxed);
    let window = VmWindow {
        lo: sp,
        hi: sp.saturating_add(8 << 20),
    };
    unwind::walk(unwind::Regs { fp, lr, sp }, &window, scratch);

    slot.target_tid.store(0, Ordering::Release);
    slot.resume.post();
    Ok(())
}

/// Readable window over the parked thread's stack. Words come through
/// `process_vm_readv`, so a walk that strays onto an unmapped page gets a
/// clean `None` instead of a fault.
struct VmWindow {
    lo: u64,
    hi: u64,
}

impl unwind::Memory for VmWindow {
    fn word(&self, addr: u64) -> Option<u64> {
        if addr < self.lo || addr.saturating_add(8) > self.hi || addr % 8 != 0 {
            return None;
        }
        linux::vm_read_word(addr)
    }
}
