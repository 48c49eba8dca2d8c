//! macOS backend: mach thread ports.
//!
//! Suspension is `thread_suspend`; registers come from `thread_get_state`
//! while the victim is parked. Between suspend and resume we must not
//! allocate, lock, or take any other unshareable resource: the suspended
//! thread may hold it, and waiting on it would deadlock the process.

use std::io;
use std::process;

use mach2::mach_types::thread_act_t;

use super::unwind::{self, StackWindow};
use super::{PeerThread, RunState, SampleError};
use crate::ffi::mac;

pub struct ThreadHandle(thread_act_t);

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        mac::deallocate_port(self.0);
    }
}

pub fn list_peers() -> io::Result<Vec<PeerThread>> {
    let ports = mac::task_threads()?;
    let mut peers = Vec::with_capacity(ports.len());
    for port in ports {
        let Ok(ident) = mac::identifier_info(port) else {
            // Thread died between enumeration and query.
            mac::deallocate_port(port);
            continue;
        };
        let Ok(basic) = mac::basic_info(port) else {
            mac::deallocate_port(port);
            continue;
        };
        let name = mac::extended_info(port).ok().and_then(|ext| {
            let len = ext.name.iter().position(|&b| b == 0).unwrap_or(ext.name.len());
            let name = String::from_utf8_lossy(&ext.name[..len]).into_owned();
            (!name.is_empty()).then_some(name)
        });
        let user_ns = basic.user_time.seconds as u64 * 1_000_000_000
            + basic.user_time.microseconds as u64 * 1_000;
        let system_ns = basic.system_time.seconds as u64 * 1_000_000_000
            + basic.system_time.microseconds as u64 * 1_000;
        peers.push(PeerThread {
            tid: ident.thread_id,
            name,
            run_state: if basic.run_state == 1 {
                RunState::Running
            } else {
                RunState::Waiting
            },
            idle: basic.flags & mac::TH_FLAGS_IDLE != 0,
            cpu_ns: user_ns + system_ns,
            handle: ThreadHandle(port),
        });
    }
    Ok(peers)
}

/// Suspends the peer, walks its stack into `scratch` (leaf first), resumes.
///
/// `scratch` must already have its full capacity reserved; see the module
/// comment for what is allowed inside the window. A failed resume aborts
/// the whole process: leaving a peer suspended deadlocks the victim, which
/// is strictly worse.
pub fn sample_thread(peer: &PeerThread, scratch: &mut Vec<u64>) -> Result<(), SampleError> {
    let port = peer.handle.0;
    if mac::suspend(port).is_err() {
        return Err(SampleError::Suspend);
    }

    let walked = (|| {
        let (pc, sp, fp, lr) = mac::unwind_registers(port).map_err(|_| SampleError::Registers)?;
        let hi = stack_top(port).unwrap_or(sp.saturating_add(8 << 20));
        let window = StackWindow { lo: sp, hi };
        // No link register on x86: the instruction pointer seeds the walk.
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        let lr = pc;
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        let _ = pc;
        unwind::walk(unwind::Regs { fp, lr, sp }, &window, scratch);
        Ok(())
    })();

    if mac::resume(port).is_err() {
        process::abort();
    }
    walked
}

fn stack_top(port: thread_act_t) -> Option<u64> {
    unsafe {
        let pthread = libc::pthread_from_mach_thread_np(port);
        if pthread.is_null() {
            return None;
        }
        Some(libc::pthread_get_stackaddr_np(pthread) as u64)
    }
}
