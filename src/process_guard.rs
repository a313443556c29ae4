//! Process lifecycle management for spawned commands
//!
//! Every command runs in its own process group and is tracked in a global
//! registry so a second interrupt can take down the whole tree.
//!
//! Interrupts are two-staged. The first SIGINT/SIGTERM/SIGHUP only sets the
//! build's `CancelToken`; the sequencer honours it between steps, so a running
//! step always completes. A second signal terminates tracked children and
//! exits. Neither path unmounts anything: partial chroot mounts are unwound
//! only through `Producer::abort_cleanup`.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::trace!("Registered child process PID {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::trace!("Unregistered child process PID {}", pid);
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked process groups.
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.pids.is_empty() {
            return;
        }
        tracing::info!("Terminating {} child process group(s)...", self.pids.len());

        let pids: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                tracing::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for (pid, e) in kill_survivors(&pids) {
            tracing::warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
        }
        self.pids.clear();
    }
}

/// SIGKILL every group in `pids` whose leader is still alive. Returns the
/// groups that could not be signalled.
fn kill_survivors(pids: &[u32]) -> Vec<(u32, nix::Error)> {
    pids.iter()
        .copied()
        .filter(|&pid| is_process_alive(pid))
        .filter_map(|pid| {
            tracing::warn!("Process group {} did not terminate, sending SIGKILL", pid);
            send_signal_to_group(pid, Signal::SIGKILL).err().map(|e| (pid, e))
        })
        .collect()
}

/// Send SIGKILL to the process group led by `pgid`.
pub fn kill_process_group(pgid: u32) -> Result<(), nix::Error> {
    send_signal_to_group(pgid, Signal::SIGKILL)
}

fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // Zombies still accept signals but are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }
    true
}

/// Cooperative cancellation flag, checked between pipeline steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Install signal handlers that cancel `token` on the first signal and
/// terminate children and exit on the second.
pub fn init_signal_handlers(token: CancelToken) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if !token.is_cancelled() {
                tracing::warn!(
                    "Received signal {}; stopping after the current step (repeat to abort now)",
                    sig
                );
                token.cancel();
                continue;
            }

            tracing::warn!("Received signal {} again, terminating running commands", sig);
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that dies with us.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();
        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);
        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_terminate_all_kills_group() {
        let mut child = Command::new("sleep")
            .arg("30")
            .in_new_process_group()
            .spawn()
            .expect("spawn sleep");
        let mut registry = ChildRegistry::default();
        registry.register(child.id());

        registry.terminate_all(Duration::from_secs(2));
        let status = child.wait().expect("wait");
        assert!(!status.success());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_kill_survivors_reports_unsignalled_groups() {
        // Not a group leader, so there is no group to signal.
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = child.id();

        let failures = kill_survivors(&[pid]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, pid);
        assert_eq!(failures[0].1, nix::errno::Errno::ESRCH);

        child.kill().expect("kill sleep");
        child.wait().expect("wait");
        assert!(kill_survivors(&[pid]).is_empty());
    }
}
