//! Shared fakes for integration tests

#![allow(dead_code)]

use liveforge::command_executor::{CommandExecutor, CommandOutput, EchoPolicy};
use liveforge::process_guard::CancelToken;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

/// Records every command and file write. Commands succeed unless a failure
/// rule matches; files are written to disk for real.
#[derive(Default)]
pub struct FakeExecutor {
    commands: RefCell<Vec<String>>,
    queries: RefCell<Vec<String>>,
    writes: RefCell<Vec<PathBuf>>,
    /// (substring, exit code)
    failures: Vec<(String, i32)>,
    /// (substring, stdout) answered to queries
    answers: Vec<(String, String)>,
    /// Path substrings whose writes fail
    write_failures: Vec<String>,
    /// (substring, path, contents) written when a matching command runs
    side_effects: Vec<(String, PathBuf, String)>,
    /// Cancel this token when a matching command runs
    cancel_on: Option<(String, CancelToken)>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(mut self, pattern: &str, exit_code: i32) -> Self {
        self.failures.push((pattern.to_string(), exit_code));
        self
    }

    pub fn answer(mut self, pattern: &str, stdout: &str) -> Self {
        self.answers.push((pattern.to_string(), stdout.to_string()));
        self
    }

    pub fn fail_write(mut self, pattern: &str) -> Self {
        self.write_failures.push(pattern.to_string());
        self
    }

    pub fn on_command_write(mut self, pattern: &str, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.side_effects
            .push((pattern.to_string(), path.into(), contents.to_string()));
        self
    }

    pub fn cancel_on(mut self, pattern: &str, token: CancelToken) -> Self {
        self.cancel_on = Some((pattern.to_string(), token));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.borrow().clone()
    }

    pub fn writes(&self) -> Vec<PathBuf> {
        self.writes.borrow().clone()
    }

    /// Commands containing `pattern`.
    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.commands
            .borrow()
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    /// Index of the first write whose file name is `file_name`.
    pub fn write_position(&self, file_name: &str) -> Option<usize> {
        self.writes
            .borrow()
            .iter()
            .position(|p| p.file_name().is_some_and(|n| n == file_name))
    }
}

impl CommandExecutor for FakeExecutor {
    fn execute(&self, command_line: &str, _echo: EchoPolicy) -> std::io::Result<CommandOutput> {
        self.commands.borrow_mut().push(command_line.to_string());

        for (pattern, path, contents) in &self.side_effects {
            if command_line.contains(pattern.as_str()) {
                std::fs::write(path, contents)?;
            }
        }
        if let Some((pattern, token)) = &self.cancel_on {
            if command_line.contains(pattern.as_str()) {
                token.cancel();
            }
        }

        let exit_code = self
            .failures
            .iter()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        Ok(CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 { String::new() } else { "simulated failure".into() },
        })
    }

    fn query(&self, command_line: &str) -> std::io::Result<CommandOutput> {
        self.queries.borrow_mut().push(command_line.to_string());
        let stdout = self
            .answers
            .iter()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        let shown = path.display().to_string();
        if self.write_failures.iter().any(|p| shown.contains(p.as_str())) {
            return Err(std::io::Error::other("simulated write failure"));
        }
        self.writes.borrow_mut().push(path.to_path_buf());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }
}

/// Theme directory with the given module overrides under
/// `theme/calamares/modules/<name>.yml`.
pub fn theme_with_modules(dir: &Path, modules: &[(&str, &str)]) -> PathBuf {
    let theme = dir.join("colibri");
    let modules_dir = theme.join("theme/calamares/modules");
    std::fs::create_dir_all(&modules_dir).unwrap();
    for (name, contents) in modules {
        std::fs::write(modules_dir.join(format!("{}.yml", name)), contents).unwrap();
    }
    theme
}

/// Minimal os-release for `id`.
pub fn write_os_release(root: &Path, id: &str) {
    let etc = root.join("etc");
    std::fs::create_dir_all(&etc).unwrap();
    std::fs::write(etc.join("os-release"), format!("NAME=\"Test\"\nID={}\n", id)).unwrap();
}
