// Parent-death signal for worker processes.
// On Linux the worker gets SIGTERM when the supervisor dies, and terminates
// itself if the supervisor already died between fork and exec.

/// Runs in the forked child before exec. Only async-signal-safe calls here.
#[cfg(target_os = "linux")]
pub(crate) fn set_parent_death(parent_pid: libc::pid_t) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        if libc::getppid() != parent_pid {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
    }
}

#[cfg(unix)]
pub(crate) fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // Already gone; the exit is reported through the waiter.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
pub(crate) fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination is not supported on this platform",
    ))
}
