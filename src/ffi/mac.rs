//! The handful of mach calls the sampler needs beyond what `mach2` exports.
//!
//! `mach2` has no `thread_info` binding (JohnTitor/mach2#31), so the
//! structures and the call are declared here.

use std::io::{Error, ErrorKind, Result};
use std::mem;

use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_types::thread_act_t;
use mach2::message::mach_msg_type_number_t;

pub const THREAD_BASIC_INFO: u32 = 3;
pub const THREAD_IDENTIFIER_INFO: u32 = 4;
pub const THREAD_EXTENDED_INFO: u32 = 5;

pub const TH_FLAGS_IDLE: i32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TimeValue {
    pub seconds: i32,
    pub microseconds: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ThreadBasicInfo {
    pub user_time: TimeValue,
    pub system_time: TimeValue,
    pub cpu_usage: i32,
    pub policy: i32,
    pub run_state: i32,
    pub flags: i32,
    pub suspend_count: i32,
    pub sleep_time: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ThreadIdentifierInfo {
    pub thread_id: u64,
    pub thread_handle: u64,
    pub dispatch_qaddr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ThreadExtendedInfo {
    pub user_time: u64,
    pub system_time: u64,
    pub cpu_usage: i32,
    pub policy: i32,
    pub run_state: i32,
    pub flags: i32,
    pub sleep_time: i32,
    pub curpri: i32,
    pub priority: i32,
    pub maxpri: i32,
    pub name: [u8; 64],
}

extern "C" {
    fn thread_info(
        target_act: thread_act_t,
        flavor: u32,
        thread_info_out: *mut i32,
        thread_info_out_cnt: *mut mach_msg_type_number_t,
    ) -> kern_return_t;
}

fn check(kret: kern_return_t) -> Result<()> {
    if kret == KERN_SUCCESS {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Other, format!("kern_return {kret}")))
    }
}

pub fn basic_info(thread: thread_act_t) -> Result<ThreadBasicInfo> {
    let mut info = ThreadBasicInfo::default();
    let mut count = (mem::size_of::<ThreadBasicInfo>() / mem::size_of::<i32>()) as u32;
    check(unsafe { thread_info(thread, THREAD_BASIC_INFO, &mut info as *mut _ as _, &mut count) })?;
    Ok(info)
}

pub fn identifier_info(thread: thread_act_t) -> Result<ThreadIdentifierInfo> {
    let mut info = ThreadIdentifierInfo::default();
    let mut count = (mem::size_of::<ThreadIdentifierInfo>() / mem::size_of::<i32>()) as u32;
    check(unsafe {
        thread_info(thread, THREAD_IDENTIFIER_INFO, &mut info as *mut _ as _, &mut count)
    })?;
    Ok(info)
}

pub fn extended_info(thread: thread_act_t) -> Result<ThreadExtendedInfo> {
    let mut info: ThreadExtendedInfo = unsafe { mem::zeroed() };
    let mut count = (mem::size_of::<ThreadExtendedInfo>() / mem::size_of::<i32>()) as u32;
    check(unsafe { thread_info(thread, THREAD_EXTENDED_INFO, &mut info as *mut _ as _, &mut count) })?;
    Ok(info)
}

/// All threads of the current task. The caller must deallocate every port
/// with [`deallocate_port`] once done with it.
pub fn task_threads() -> Result<Vec<thread_act_t>> {
    let mut list: *mut thread_act_t = std::ptr::null_mut();
    let mut count: mach_msg_type_number_t = 0;
    let task = unsafe { mach2::traps::mach_task_self() };
    check(unsafe { mach2::task::task_threads(task, &mut list, &mut count) })?;
    let threads = unsafe { std::slice::from_raw_parts(list, count as usize) }.to_vec();
    unsafe {
        mach2::vm::mach_vm_deallocate(
            task,
            list as u64,
            (count as usize * mem::size_of::<thread_act_t>()) as u64,
        );
    }
    Ok(threads)
}

pub fn deallocate_port(port: thread_act_t) {
    unsafe {
        mach2::mach_port::mach_port_deallocate(mach2::traps::mach_task_self(), port);
    }
}

pub fn suspend(thread: thread_act_t) -> Result<()> {
    check(unsafe { mach2::thread_act::thread_suspend(thread) })
}

pub fn resume(thread: thread_act_t) -> Result<()> {
    check(unsafe { mach2::thread_act::thread_resume(thread) })
}

/// `(pc, sp, fp, lr)` of a suspended thread.
#[cfg(target_arch = "aarch64")]
pub fn unwind_registers(thread: thread_act_t) -> Result<(u64, u64, u64, u64)> {
    let mut state = mach2::structs::arm_thread_state64_t::new();
    let mut count = mach2::structs::arm_thread_state64_t::count();
    check(unsafe {
        mach2::thread_act::thread_get_state(
            thread,
            mach2::thread_status::ARM_THREAD_STATE64,
            (&mut state) as *mut _ as *mut _,
            &mut count,
        )
    })?;
    Ok((state.__pc, state.__sp, state.__fp, state.__lr))
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn unwind_registers(thread: thread_act_t) -> Result<(u64, u64, u64, u64)> {
    let mut state = mach2::structs::x86_thread_state64_t::new();
    let mut count = mach2::structs::x86_thread_state64_t::count();
    check(unsafe {
        mach2::thread_act::thread_get_state(
            thread,
            mach2::thread_status::x86_THREAD_STATE64,
            (&mut state) as *mut _ as *mut _,
            &mut count,
        )
    })?;
    // x86 has no link register; callers seed the walk from __rip instead.
    Ok((state.__rip, state.__rsp, state.__rbp, 0))
}
