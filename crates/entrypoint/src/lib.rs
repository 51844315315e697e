/*
 * 5D Labs Build Platform - Step Entrypoint
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Step entrypoint
//!
//! Every step container of a build pod starts at the same time. This binary is
//! injected as each step's real entrypoint and serializes them through marker
//! files on a shared volume:
//! - wait for the previous step's post-run file (when configured)
//! - run the step's real command, streaming its output
//! - write the exit code to this step's post-run file, unblocking the next step
//!
//! The configuration arrives as JSON in the [`OPTIONS_ENV_VAR`] environment variable.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Environment variable carrying the JSON-encoded [`EntrypointOptions`]
pub const OPTIONS_ENV_VAR: &str = "ENTRYPOINT_OPTIONS";

/// Delay between checks for the previous step's marker
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code reported when the step could not be started or configured
const FAILURE_EXIT_CODE: i32 = 1;

/// Exit code reported when the step's program does not exist
const NOT_FOUND_EXIT_CODE: i32 = 127;

/// Options for a single step, written by the controller when it rewrites the step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrypointOptions {
    /// Real command followed by its arguments
    pub args: Vec<String>,

    /// File receiving a copy of the step's stdout and stderr (empty disables it)
    #[serde(default)]
    pub process_log: String,

    /// File receiving the step's exit code once it finishes (empty disables it)
    #[serde(default)]
    pub marker_file: String,

    /// Whether to block until `pre_run_file` exists before starting
    #[serde(default)]
    pub should_wait_for_prev_step: bool,

    /// Post-run file of the previous step
    #[serde(default)]
    pub pre_run_file: String,

    /// Whether to write `post_run_file` after the command finishes
    #[serde(default)]
    pub should_run_post_run: bool,

    /// File the next step waits for
    #[serde(default)]
    pub post_run_file: String,
}

#[derive(Debug, Error)]
pub enum EntrypointError {
    #[error("{OPTIONS_ENV_VAR} is not set")]
    MissingOptions,

    #[error("Failed to parse entrypoint options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    #[error("Failed to check for pre-run file {path}: {source}")]
    PreRunCheck { path: String, source: io::Error },

    #[error("Failed to write marker file {path}: {source}")]
    MarkerWrite { path: String, source: io::Error },
}

impl EntrypointOptions {
    /// Parse options from their JSON encoding
    pub fn from_json(raw: &str) -> Result<Self, EntrypointError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read options from [`OPTIONS_ENV_VAR`]
    pub fn from_env() -> Result<Self, EntrypointError> {
        let raw = std::env::var(OPTIONS_ENV_VAR).map_err(|_| EntrypointError::MissingOptions)?;
        Self::from_json(&raw)
    }

    /// Encode options for embedding in a container environment
    pub fn to_json(&self) -> Result<String, EntrypointError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Run one step: wait for the previous step, run the command, signal the next step.
///
/// Returns the exit code the entrypoint process should exit with.
pub async fn run(options: &EntrypointOptions) -> Result<i32, EntrypointError> {
    if options.should_wait_for_prev_step {
        info!("Waiting for previous step to finish: {}", options.pre_run_file);
        wait_for_file(Path::new(&options.pre_run_file), POLL_INTERVAL).await?;
    }

    let process_log = Some(options.process_log.as_str())
        .filter(|p| !p.is_empty())
        .map(Path::new);

    let exit_code = if options.args.is_empty() {
        error!("No command to run: entrypoint options contain no args");
        FAILURE_EXIT_CODE
    } else {
        run_command(&options.args, process_log).await
    };

    // The next step is released regardless of this step's result; failures
    // are reported through the pod status.
    if options.should_run_post_run {
        write_exit_code(Path::new(&options.post_run_file), exit_code).await?;
    }
    if !options.marker_file.is_empty() {
        write_exit_code(Path::new(&options.marker_file), exit_code).await?;
    }

    Ok(exit_code)
}

/// Block until `path` exists. A missing file keeps waiting; any other error aborts.
pub async fn wait_for_file(path: &Path, interval: Duration) -> Result<(), EntrypointError> {
    loop {
        match tokio::fs::metadata(path).await {
            Ok(_) => {
                debug!("Found pre-run file {}", path.display());
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                return Err(EntrypointError::PreRunCheck {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        }
    }
}

/// Run `args[0]` with the remaining args and return its exit code.
///
/// Output is forwarded to this process's stdout/stderr and appended to `process_log`.
pub async fn run_command(args: &[String], process_log: Option<&Path>) -> i32 {
    let Some((program, rest)) = args.split_first() else {
        return FAILURE_EXIT_CODE;
    };

    let mut child = match Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to start {}: {}", program, e);
            return if e.kind() == io::ErrorKind::NotFound {
                NOT_FOUND_EXIT_CODE
            } else {
                FAILURE_EXIT_CODE
            };
        }
    };

    let stdout_task = child.stdout.take().map(|out| {
        let log = process_log.map(Path::to_path_buf);
        tokio::spawn(async move {
            let log = open_log(log.as_deref()).await;
            tee(out, tokio::io::stdout(), log).await
        })
    });
    let stderr_task = child.stderr.take().map(|err| {
        let log = process_log.map(Path::to_path_buf);
        tokio::spawn(async move {
            let log = open_log(log.as_deref()).await;
            tee(err, tokio::io::stderr(), log).await
        })
    });

    let status = child.wait().await;

    for task in [stdout_task, stderr_task].into_iter().flatten() {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to forward step output: {}", e),
            Err(e) => error!("Output forwarding task panicked: {}", e),
        }
    }

    match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            error!("Failed to wait for {}: {}", program, e);
            FAILURE_EXIT_CODE
        }
    }
}

/// Write `code` as decimal text to `path`
pub async fn write_exit_code(path: &Path, code: i32) -> Result<(), EntrypointError> {
    tokio::fs::write(path, code.to_string())
        .await
        .map_err(|source| EntrypointError::MarkerWrite {
            path: path.display().to_string(),
            source,
        })
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    if status.success() {
        0
    } else {
        FAILURE_EXIT_CODE
    }
}

async fn open_log(path: Option<&Path>) -> Option<File> {
    let path = path?;
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            error!("Failed to open process log {}: {}", path.display(), e);
            None
        }
    }
}

async fn tee<R, W>(mut reader: R, mut console: W, mut log: Option<File>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        console.write_all(&buf[..n]).await?;
        console.flush().await?;
        if let Some(file) = log.as_mut() {
            file.write_all(&buf[..n]).await?;
        }
    }
    if let Some(file) = log.as_mut() {
        file.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn options_use_camel_case_field_names() {
        let raw = r#"{
            "args": ["echo", "hi"],
            "processLog": "/tools/process-log.txt",
            "markerFile": "/tools/marker-file.txt",
            "shouldWaitForPrevStep": true,
            "preRunFile": "/tools/0",
            "shouldRunPostRun": true,
            "postRunFile": "/tools/1"
        }"#;

        let options = EntrypointOptions::from_json(raw).unwrap();
        assert_eq!(options.args, vec!["echo", "hi"]);
        assert!(options.should_wait_for_prev_step);
        assert_eq!(options.pre_run_file, "/tools/0");
        assert_eq!(options.post_run_file, "/tools/1");

        let encoded = options.to_json().unwrap();
        assert!(encoded.contains("\"shouldWaitForPrevStep\":true"));
        assert!(encoded.contains("\"postRunFile\":\"/tools/1\""));
    }

    #[test]
    fn malformed_options_are_rejected() {
        assert!(matches!(
            EntrypointOptions::from_json("{\"args\": \"not-a-list\"}"),
            Err(EntrypointError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn failing_step_still_releases_next_step() {
        let dir = TempDir::new().unwrap();
        let post_run = dir.path().join("0");
        let log = dir.path().join("process-log.txt");

        let options = EntrypointOptions {
            args: sh("echo building; exit 3"),
            process_log: log.display().to_string(),
            should_run_post_run: true,
            post_run_file: post_run.display().to_string(),
            ..Default::default()
        };

        let code = run(&options).await.unwrap();
        assert_eq!(code, 3);
        assert_eq!(std::fs::read_to_string(&post_run).unwrap(), "3");
        assert!(std::fs::read_to_string(&log).unwrap().contains("building"));
    }

    #[tokio::test]
    async fn step_waits_for_previous_marker() {
        let dir = TempDir::new().unwrap();
        let pre_run = dir.path().join("0");
        let post_run = dir.path().join("1");
        let order = dir.path().join("order");

        let options = EntrypointOptions {
            args: sh(&format!("echo second >> {}", order.display())),
            should_wait_for_prev_step: true,
            pre_run_file: pre_run.display().to_string(),
            should_run_post_run: true,
            post_run_file: post_run.display().to_string(),
            ..Default::default()
        };

        let step = tokio::spawn(async move { run(&options).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!order.exists(), "step ran before its predecessor finished");

        std::fs::write(&order, "first\n").unwrap();
        std::fs::write(&pre_run, "0").unwrap();

        let code = step.await.unwrap().unwrap();
        assert_eq!(code, 0);
        assert_eq!(std::fs::read_to_string(&order).unwrap(), "first\nsecond\n");
        assert_eq!(std::fs::read_to_string(&post_run).unwrap(), "0");
    }

    #[tokio::test]
    async fn missing_program_reports_not_found_and_writes_marker() {
        let dir = TempDir::new().unwrap();
        let post_run = dir.path().join("0");
        let marker = dir.path().join("marker-file.txt");

        let options = EntrypointOptions {
            args: vec!["/definitely/not/a/program".to_string()],
            marker_file: marker.display().to_string(),
            should_run_post_run: true,
            post_run_file: post_run.display().to_string(),
            ..Default::default()
        };

        let code = run(&options).await.unwrap();
        assert_eq!(code, NOT_FOUND_EXIT_CODE);
        assert_eq!(std::fs::read_to_string(&post_run).unwrap(), "127");
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "127");
    }

    #[tokio::test]
    async fn empty_args_fail_without_blocking_the_chain() {
        let dir = TempDir::new().unwrap();
        let post_run = dir.path().join("0");

        let options = EntrypointOptions {
            should_run_post_run: true,
            post_run_file: post_run.display().to_string(),
            ..Default::default()
        };

        assert_eq!(run(&options).await.unwrap(), FAILURE_EXIT_CODE);
        assert_eq!(std::fs::read_to_string(&post_run).unwrap(), "1");
    }

    #[tokio::test]
    async fn unreadable_pre_run_path_aborts_the_wait() {
        let dir = TempDir::new().unwrap();
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, "x").unwrap();

        let result = wait_for_file(&not_a_dir.join("0"), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(EntrypointError::PreRunCheck { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_step_reports_signal_exit_code() {
        let code = run_command(&sh("kill -9 $$"), None).await;
        assert_eq!(code, 128 + 9);
    }
}
