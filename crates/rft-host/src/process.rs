use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

fn signal_process_group(child: &tokio::process::Child, signal: Signal) -> bool {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        return killpg(Pid::from_raw(pid), signal).is_ok();
    }
    false
}

/// Ask the entire process group of `child` to exit via `killpg(SIGTERM)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. Returns `false` if the child has already been reaped or
/// the signal could not be delivered.
pub fn terminate_process_group(child: &tokio::process::Child) -> bool {
    signal_process_group(child, Signal::SIGTERM)
}

/// Kill the entire process group of `child` via `killpg(SIGKILL)`.
///
/// Same requirements as [`terminate_process_group`].
pub fn kill_process_group(child: &tokio::process::Child) -> bool {
    signal_process_group(child, Signal::SIGKILL)
}
