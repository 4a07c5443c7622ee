//! Process-group spawn and signal helpers for agent subprocesses.
//!
//! Agents are spawned as leaders of their own process group so that a stop
//! signal reaches the whole tree (the CLI forks tool subprocesses).

use std::io;
use std::process::Command;

/// Make the child the leader of a new process group.
#[cfg(unix)]
pub fn configure_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
pub fn configure_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    use std::io::ErrorKind;

    let pid = pid as libc::pid_t;
    let pgid = unsafe { libc::getpgid(pid) };
    if pgid == -1 {
        let err = io::Error::last_os_error();
        // The process is already gone; nothing to signal.
        if err.raw_os_error() == Some(libc::ESRCH) || err.kind() == ErrorKind::NotFound {
            return Ok(());
        }
        return Err(err);
    }

    let result = unsafe { libc::killpg(pgid, signal) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) || err.kind() == ErrorKind::NotFound {
            return Ok(());
        }
        return Err(err);
    }

    Ok(())
}

/// Graceful stop: SIGTERM to the child's process group.
#[cfg(unix)]
pub fn terminate_group(pid: u32) -> io::Result<()> {
    signal_group(pid, libc::SIGTERM)
}

#[cfg(not(unix))]
pub fn terminate_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

/// Hard kill: SIGKILL to the child's process group.
#[cfg(unix)]
pub fn kill_group(pid: u32) -> io::Result<()> {
    signal_group(pid, libc::SIGKILL)
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::{Command, Stdio};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{configure_process_group, kill_group, terminate_group};

    fn spawn_sleeper() -> std::process::Child {
        let mut command = Command::new("sleep");
        command.arg("30");
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
        configure_process_group(&mut command);
        command.spawn().expect("spawn sleep")
    }

    fn wait_for_exit(child: &mut std::process::Child, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            if child.try_wait().expect("try_wait").is_some() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn terminate_group_stops_a_spawned_child() {
        let mut child = spawn_sleeper();
        terminate_group(child.id()).expect("terminate group");
        assert!(wait_for_exit(&mut child, Duration::from_secs(5)));
    }

    #[test]
    fn kill_group_stops_a_spawned_child() {
        let mut child = spawn_sleeper();
        kill_group(child.id()).expect("kill group");
        assert!(wait_for_exit(&mut child, Duration::from_secs(5)));
    }

    #[test]
    fn signalling_an_exited_child_is_not_an_error() {
        let mut child = spawn_sleeper();
        kill_group(child.id()).expect("first kill");
        assert!(wait_for_exit(&mut child, Duration::from_secs(5)));
        // The pid is reaped; a second signal must be a no-op.
        terminate_group(child.id()).expect("terminate after exit");
        kill_group(child.id()).expect("kill after exit");
    }
}
