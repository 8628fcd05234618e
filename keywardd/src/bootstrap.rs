/// Process-level hardening applied at daemon startup.
///
/// **`PR_SET_DUMPABLE 0`** blocks `/proc/<pid>/mem` reads by other
/// non-root processes and disables core dumps.  The agent holds no private
/// keys, but it does hold the vault capability handles for every key it
/// serves.
///
/// Best-effort: a failure is logged and the daemon continues.
#[cfg(target_os = "linux")]
pub fn secure_bootstrap() {
    set_not_dumpable();
}

#[cfg(not(target_os = "linux"))]
pub fn secure_bootstrap() {}

#[cfg(target_os = "linux")]
fn set_not_dumpable() {
    // SAFETY: prctl with PR_SET_DUMPABLE only reads the integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0 as libc::c_ulong, 0, 0, 0) };
    if ret == 0 {
        tracing::info!("PR_SET_DUMPABLE=0: core dumps and /proc/pid/mem access disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}
