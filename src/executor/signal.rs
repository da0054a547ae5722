//! Process-group signalling
//!
//! Supervised children are spawned as leaders of their own process group,
//! so signalling the group also reaches anything the scenario forked.

#[cfg(unix)]
pub fn terminate_group(pid: u32) -> bool {
    send_to_group(pid, libc::SIGTERM)
}

#[cfg(unix)]
pub fn kill_group(pid: u32) -> bool {
    send_to_group(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn send_to_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pgid <= 0 {
        return false;
    }
    // SAFETY: killpg only delivers a signal; no memory is shared with the callee.
    unsafe { libc::killpg(pgid, signal) == 0 }
}

#[cfg(not(unix))]
pub fn terminate_group(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> bool {
    false
}
