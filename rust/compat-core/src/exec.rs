//! External command execution.
//!
//! Every external collaborator (driver query tool, collective backend,
//! bandwidth tool) is run through [`run`], which never fails: spawn errors,
//! timeouts and non-zero exits all come back as a [`CommandOutput`] with a
//! shell-style exit code.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Exit code reported when the executable cannot be found.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when the command exceeded its timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported for any other spawn failure or signal death.
pub const EXIT_SPAWN_FAILED: i32 = 1;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Best available explanation of a failure.
    pub fn detail(&self) -> String {
        if !self.stderr.is_empty() {
            self.stderr.clone()
        } else if !self.stdout.is_empty() {
            self.stdout.clone()
        } else {
            format!("exit={}", self.code)
        }
    }

    pub fn first_line(&self) -> &str {
        first_non_empty_line(&self.stdout)
    }
}

pub fn first_non_empty_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

/// Run a command to completion, capturing trimmed stdout/stderr.
pub async fn run(spec: &CommandSpec) -> CommandOutput {
    let child = match spec.to_command().spawn() {
        Ok(child) => child,
        Err(e) => {
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                EXIT_NOT_FOUND
            } else {
                EXIT_SPAWN_FAILED
            };
            return CommandOutput {
                code,
                stdout: String::new(),
                stderr: format!("{}: {}", spec.program, e),
            };
        }
    };

    match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandOutput {
            code: output.status.code().unwrap_or(EXIT_SPAWN_FAILED),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Ok(Err(e)) => CommandOutput {
            code: EXIT_SPAWN_FAILED,
            stdout: String::new(),
            stderr: e.to_string(),
        },
        // The child is dropped with the future and killed by kill_on_drop.
        Err(_) => CommandOutput {
            code: EXIT_TIMEOUT,
            stdout: String::new(),
            stderr: "command timeout".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo hello"]);
        let out = run(&spec).await;
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.first_line(), "hello");
    }

    #[tokio::test]
    async fn test_run_env_passthrough() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .args(["-c", "echo $COMPAT_TEST_VALUE"])
            .env("COMPAT_TEST_VALUE", "42");
        let out = run(&spec).await;
        assert_eq!(out.stdout, "42");
    }

    #[tokio::test]
    async fn test_run_not_found() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", Duration::from_secs(5));
        let out = run(&spec).await;
        assert_eq!(out.code, EXIT_NOT_FOUND);
        assert!(out.detail().contains("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let spec = CommandSpec::new("sleep", Duration::from_millis(100)).arg("5");
        let out = run(&spec).await;
        assert_eq!(out.code, EXIT_TIMEOUT);
        assert_eq!(out.detail(), "command timeout");
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo oops >&2; exit 3"]);
        let out = run(&spec).await;
        assert_eq!(out.code, 3);
        assert_eq!(out.detail(), "oops");
    }

    #[test]
    fn test_first_non_empty_line() {
        assert_eq!(first_non_empty_line("\n\n  535.104.05  \nsecond"), "535.104.05");
        assert_eq!(first_non_empty_line(""), "");
    }
}
