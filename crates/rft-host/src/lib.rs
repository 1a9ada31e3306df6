//! Host-side backends: the `virsh` CLI for libvirt and OpenSSH for guest shells.

mod command;
mod prerequisites;
mod process;
mod ssh;
mod virsh;

pub use command::{
    CommandError, CommandOutput, Privilege, exec, exec_blocking, exec_ignore_errors, exec_output,
};
pub use prerequisites::check_prerequisites;
pub use process::{kill_process_group, terminate_process_group};
pub use ssh::{MAX_SOCKET_PATH, OpenSshShell};
pub use virsh::VirshDriver;
