//! command_executor.rs - Runs external commands for every pipeline component.
//!
//! Everything that touches the host (package managers, rsync, mksquashfs,
//! mount) goes through the `CommandExecutor` trait. `ShellExecutor` runs
//! commands for real; `ScriptRecorder` captures them as shell scripts for the
//! script-only produce mode.

use crate::error::CommandFailure;
use crate::process_guard::{kill_process_group, ChildRegistry, CommandProcessGroup};
use std::cell::RefCell;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code reported for a command killed by the executor's timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Whether command output streams to the invoking console.
///
/// A pure side channel: output is captured either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoPolicy {
    #[default]
    Silent,
    Stream,
}

impl EchoPolicy {
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose { Self::Stream } else { Self::Silent }
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell command lines.
///
/// Implementations must run one command to completion before returning; the
/// pipeline never has two commands in flight.
pub trait CommandExecutor {
    /// Run `command_line` through the shell.
    fn execute(&self, command_line: &str, echo: EchoPolicy) -> std::io::Result<CommandOutput>;

    /// Run a read-only probe. Never mutates state, so recorders may run it for real.
    fn query(&self, command_line: &str) -> std::io::Result<CommandOutput> {
        self.execute(command_line, EchoPolicy::Silent)
    }

    /// Materialise a file, creating parent directories.
    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }

    /// Run and convert a non-zero exit (or spawn failure) into `CommandFailure`.
    fn run(&self, command_line: &str, echo: EchoPolicy) -> Result<CommandOutput, CommandFailure> {
        match self.execute(command_line, echo) {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => Err(CommandFailure::new(command_line, output.exit_code, output.stderr)),
            Err(e) => Err(CommandFailure::new(command_line, -1, e.to_string())),
        }
    }
}

/// Quote a value for safe interpolation into a `sh -c` command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+@%,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Prefix a command so it runs inside `target_root` when one is given.
pub fn in_root(target_root: Option<&Path>, command_line: &str) -> String {
    match target_root {
        Some(root) => format!("chroot {} {}", shell_quote(&root.display().to_string()), command_line),
        None => command_line.to_string(),
    }
}

/// Executes commands with `sh -c` in their own process group.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`; they report exit code 124.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    fn wait(&self, child: &mut Child) -> std::io::Result<Option<i32>> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait()?.code());
        };
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status.code());
            }
            if start.elapsed() >= timeout {
                warn!(pid = child.id(), "Command exceeded {:?}, killing", timeout);
                if kill_process_group(child.id()).is_err() {
                    child.kill()?;
                }
                child.wait()?;
                return Ok(Some(TIMEOUT_EXIT_CODE));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

fn drain<R: Read + Send + 'static>(reader: R, echo: EchoPolicy, to_stderr: bool) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut captured = String::new();
        for line in BufReader::new(reader).lines().map_while(std::result::Result::ok) {
            if echo == EchoPolicy::Stream {
                if to_stderr {
                    eprintln!("{}", line);
                } else {
                    println!("{}", line);
                }
            }
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    })
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command_line: &str, echo: EchoPolicy) -> std::io::Result<CommandOutput> {
        debug!(command = command_line, "exec");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()?;

        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        let stdout = child.stdout.take().map(|s| drain(s, echo, false));
        let stderr = child.stderr.take().map(|s| drain(s, echo, true));
        let code = self.wait(&mut child);

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let exit_code = code?.unwrap_or(-1);
        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let mut stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
        if exit_code == TIMEOUT_EXIT_CODE && self.timeout.is_some() && stderr.is_empty() {
            stderr = "timed out".to_string();
        }

        debug!(command = command_line, exit_code, "exit");
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// Records commands into named script sections instead of running them.
///
/// Read-only probes are forwarded to `probe` so detection (installed display
/// managers, filesystem tools) still reflects the host.
pub struct ScriptRecorder<'a> {
    probe: &'a dyn CommandExecutor,
    sections: RefCell<Vec<(String, Vec<String>)>>,
}

impl<'a> ScriptRecorder<'a> {
    pub fn new(probe: &'a dyn CommandExecutor) -> Self {
        Self {
            probe,
            sections: RefCell::new(vec![("main".to_string(), Vec::new())]),
        }
    }

    /// Start a new script section; later commands land in it.
    pub fn section(&self, name: &str) {
        let mut sections = self.sections.borrow_mut();
        if sections.last().is_some_and(|(_, lines)| lines.is_empty()) {
            sections.pop();
        }
        sections.push((name.to_string(), Vec::new()));
    }

    fn record(&self, line: String) {
        let mut sections = self.sections.borrow_mut();
        if let Some((_, lines)) = sections.last_mut() {
            lines.push(line);
        }
    }

    /// Recorded sections with their command lines, in recording order.
    pub fn sections(&self) -> Vec<(String, Vec<String>)> {
        self.sections
            .borrow()
            .iter()
            .filter(|(_, lines)| !lines.is_empty())
            .cloned()
            .collect()
    }

    /// Render one section as a standalone shell script.
    pub fn render(name: &str, lines: &[String]) -> String {
        let mut script = format!("#!/bin/sh\n# {}\n\n", name);
        for line in lines {
            script.push_str(line);
            script.push('\n');
        }
        script
    }
}

impl CommandExecutor for ScriptRecorder<'_> {
    fn execute(&self, command_line: &str, _echo: EchoPolicy) -> std::io::Result<CommandOutput> {
        self.record(command_line.to_string());
        Ok(CommandOutput::default())
    }

    fn query(&self, command_line: &str) -> std::io::Result<CommandOutput> {
        self.probe.query(command_line)
    }

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        let target = shell_quote(&path.display().to_string());
        if let Some(parent) = path.parent() {
            self.record(format!("mkdir -p {}", shell_quote(&parent.display().to_string())));
        }
        let mut body = contents.to_string();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        self.record(format!("cat > {} <<'LIVEFORGE_EOF'\n{}LIVEFORGE_EOF", target, body));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("vim"), "vim");
        assert_eq!(shell_quote("/home/live user"), "'/home/live user'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_in_root() {
        assert_eq!(in_root(None, "pacman -Qi vim"), "pacman -Qi vim");
        assert_eq!(
            in_root(Some(Path::new("/tmp/stage")), "pacman -Qi vim"),
            "chroot /tmp/stage pacman -Qi vim"
        );
    }

    #[test]
    fn test_shell_executor_captures_output() {
        let exec = ShellExecutor::new();
        let out = exec.execute("echo hello; echo oops 1>&2; exit 3", EchoPolicy::Silent).unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[test]
    fn test_run_maps_failure() {
        let exec = ShellExecutor::new();
        let err = exec.run("echo bad 1>&2; exit 2", EchoPolicy::Silent).unwrap_err();
        assert_eq!(err.exit_code, 2);
        assert_eq!(err.stderr.trim(), "bad");
    }

    #[test]
    fn test_timeout_reports_ordinary_failure() {
        let exec = ShellExecutor::with_timeout(Duration::from_millis(200));
        let err = exec.run("sleep 5", EchoPolicy::Silent).unwrap_err();
        assert_eq!(err.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn test_recorder_sections_and_heredoc() {
        let probe = ShellExecutor::new();
        let recorder = ScriptRecorder::new(&probe);
        recorder.section("snapshot");
        recorder.execute("rsync -aR /etc /stage", EchoPolicy::Silent).unwrap();
        recorder.section("installer");
        recorder
            .write_file(Path::new("/stage/etc/calamares/modules/mount.conf"), "---\n")
            .unwrap();

        let sections = recorder.sections();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].0, "snapshot");
        assert_eq!(sections[1].1[0], "mkdir -p /stage/etc/calamares/modules");
        assert!(sections[1].1[1].starts_with("cat > /stage/etc/calamares/modules/mount.conf"));
        assert!(!Path::new("/stage/etc/calamares/modules/mount.conf").exists());
    }
}
