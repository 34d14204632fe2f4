//! Subprocess execution with per-call timeouts.
//!
//! Acquirers, installers, provisioners and the cluster prober all shell
//! out through here. Output is captured so failures can surface the
//! command's stderr in the error chain.

use crate::errors::Error;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Captured result of a finished subprocess
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a command and capture its output. A non-zero exit is NOT an error
/// here; callers that need one should use [`run_checked`].
pub fn run_captured(
    program: &str,
    args: &[&str],
    env_vars: &HashMap<String, String>,
    working_dir: Option<&Path>,
    timeout_secs: u64,
    dry_run: bool,
) -> Result<CommandOutput> {
    if dry_run {
        info!("Dry run: would execute '{} {}'", program, args.join(" "));
        return Ok(CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    debug!(
        "Executing '{} {}' (timeout {}s)",
        program,
        args.join(" "),
        timeout_secs
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime for subprocess")?;

    let output = runtime.block_on(async {
        let mut command = tokio::process::Command::new(program);
        command.args(args).envs(env_vars).kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        match tokio::time::timeout(Duration::from_secs(timeout_secs), command.output()).await {
            Ok(result) => result
                .with_context(|| format!("failed to spawn '{}'", program))
                .map(Some),
            Err(_elapsed) => Ok(None),
        }
    })?;

    let Some(output) = output else {
        return Err(Error::Timeout {
            command: format!("{} {}", program, args.join(" ")),
            seconds: timeout_secs,
        }
        .into());
    };

    let result = CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    debug!(
        "'{}' exited with {:?} ({} bytes stdout, {} bytes stderr)",
        program,
        result.exit_code,
        result.stdout.len(),
        result.stderr.len()
    );

    Ok(result)
}

/// Run a command, failing on non-zero exit with the captured stderr in the
/// error message
pub fn run_checked(
    program: &str,
    args: &[&str],
    env_vars: &HashMap<String, String>,
    working_dir: Option<&Path>,
    timeout_secs: u64,
    dry_run: bool,
) -> Result<CommandOutput> {
    let output = run_captured(program, args, env_vars, working_dir, timeout_secs, dry_run)?;
    if !output.success() {
        anyhow::bail!(
            "'{} {}' exited with {:?}: {}",
            program,
            args.join(" "),
            output.exit_code,
            summarize(&output)
        );
    }
    Ok(output)
}

fn summarize(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout() {
        let output =
            run_captured("echo", &["hello"], &HashMap::new(), None, 10, false).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_nonzero_exit_is_not_an_error_when_captured() {
        let output =
            run_captured("sh", &["-c", "exit 3"], &HashMap::new(), None, 10, false).unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[test]
    fn test_run_checked_fails_on_nonzero_exit() {
        let err = run_checked(
            "sh",
            &["-c", "echo boom >&2; exit 1"],
            &HashMap::new(),
            None,
            10,
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_timeout_surfaces_as_timeout_error() {
        let err = run_captured("sleep", &["5"], &HashMap::new(), None, 1, false).unwrap_err();
        assert!(err
            .downcast_ref::<Error>()
            .map(|e| matches!(e, Error::Timeout { .. }))
            .unwrap_or(false));
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let output = run_checked(
            "definitely-not-a-real-binary",
            &[],
            &HashMap::new(),
            None,
            10,
            true,
        )
        .unwrap();
        assert!(output.success());
    }

    #[test]
    fn test_env_vars_are_passed() {
        let mut env_vars = HashMap::new();
        env_vars.insert("DESPLEGAR_TEST_VAR".to_string(), "42".to_string());
        let output = run_captured(
            "sh",
            &["-c", "echo $DESPLEGAR_TEST_VAR"],
            &env_vars,
            None,
            10,
            false,
        )
        .unwrap();
        assert_eq!(output.stdout.trim(), "42");
    }
}
