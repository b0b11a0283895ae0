/// Unix subprocess plumbing: spawn the child as leader of its own process
/// group and terminate the whole group in one signal.
///
/// The child is placed in a fresh process group at spawn time, so a single
/// `killpg` reaches it and anything it spawned. The parent re-asserts the
/// group with `setpgid` right after spawn, closing the window where a
/// just-forked child is not yet signalable as a group.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// A child process that leads its own process group.
#[derive(Debug)]
pub struct GroupChild {
    pid: Pid,
    child: Child,
}

impl GroupChild {
    /// Process ID of the child (equal to its process group ID).
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Process ID as a signal target.
    pub fn raw_pid(&self) -> Pid {
        self.pid
    }

    /// Take the stdout handle for async reading, if piped.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr handle for async reading, if piped.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// Spawn `program` with `args` in its own process group.
///
/// With `capture` set, stdout and stderr are piped for the caller to forward;
/// otherwise both are discarded. Stdin is always closed. OS spawn errors are
/// returned verbatim.
pub fn spawn_group(program: &Path, args: &[String], capture: bool) -> io::Result<GroupChild> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .process_group(0); // New process group for clean kill
    if capture {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let child = command.spawn()?;
    let raw = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned child has no PID"))?;
    let pid = Pid::from_raw(raw as i32);
    // Re-assert from the parent side too; EACCES just means the child has
    // already exec'd with the group in place.
    let _ = setpgid(pid, pid);
    tracing::debug!(pid = pid.as_raw(), program = %program.display(), "spawned process group");

    Ok(GroupChild { pid, child })
}

/// Send SIGTERM to the child's process group.
///
/// `ESRCH` and `EPERM` are treated as success: both mean the group is already
/// gone, which is the outcome termination wanted anyway.
pub fn terminate_group(pid: Pid) -> io::Result<()> {
    match killpg(pid, Signal::SIGTERM) {
        Ok(()) => {
            tracing::debug!(pid = pid.as_raw(), "sent SIGTERM to process group");
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => {
            tracing::debug!(pid = pid.as_raw(), "process group already exited");
            Ok(())
        }
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}
