// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! External process channel: spawn the host VCS as a child process with
//! piped standard streams, write to its stdin, and drain its stdout
//! concurrently so neither side can deadlock on a full pipe buffer.

use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::HostVcsError;

/// A spawned child process with piped stdin/stdout. Stderr is inherited by
/// default so errors surface directly to the user; pass
/// [`ProcessChannel::spawn_capturing_stderr`] when the caller needs to
/// capture it instead.
pub struct ProcessChannel {
    child: Child,
    command_label: String,
}

impl ProcessChannel {
    /// Spawn `program` with `args`, piping stdin and stdout and inheriting
    /// stderr.
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self, HostVcsError> {
        Self::spawn_with_stderr(program, args, Stdio::inherit())
    }

    /// Spawn `program` with `args`, piping stdin, stdout, and stderr.
    pub fn spawn_capturing_stderr(program: &str, args: &[&str]) -> Result<Self, HostVcsError> {
        Self::spawn_with_stderr(program, args, Stdio::piped())
    }

    fn spawn_with_stderr(program: &str, args: &[&str], stderr: Stdio) -> Result<Self, HostVcsError> {
        let command_label = format!("{program} {}", args.join(" "));
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()
            .map_err(|source| HostVcsError::SpawnFailed { command: command_label.clone(), source })?;
        Ok(Self { child, command_label })
    }

    /// Write `input` to the child's stdin, then concurrently drain its
    /// stdout into memory while stdin is still being written. Draining on
    /// a separate task (rather than write-then-read) is required: if the
    /// child writes more than fits in the OS pipe buffer before we start
    /// reading, a strictly sequential write-then-read would deadlock.
    ///
    /// If the process receives a terminating signal while this is in
    /// flight, the child is killed and reaped before returning an error,
    /// rather than left to run or leaked as an orphan.
    ///
    /// Returns the child's captured stdout once both sides finish and the
    /// child has exited; fails on a non-zero exit status.
    pub async fn exchange(mut self, input: Vec<u8>) -> Result<Vec<u8>, HostVcsError> {
        let mut stdin = self.child.stdin.take().expect("stdin was piped at spawn");
        let mut stdout = self.child.stdout.take().expect("stdout was piped at spawn");
        let command_label = self.command_label.clone();

        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });

        let io = async {
            let write_result = writer
                .await
                .map_err(|_| HostVcsError::ProtocolViolation {
                    command: command_label.clone(),
                    detail: "stdin writer task panicked".into(),
                })?;
            let read_result = reader
                .await
                .map_err(|_| HostVcsError::ProtocolViolation {
                    command: command_label.clone(),
                    detail: "stdout reader task panicked".into(),
                })?;

            write_result.map_err(|source| HostVcsError::SpawnFailed { command: command_label.clone(), source })?;
            read_result.map_err(|source| HostVcsError::SpawnFailed { command: command_label.clone(), source })
        };

        let output = run_until_signalled(io, &mut self.child, &command_label).await?;

        let status = self
            .child
            .wait()
            .await
            .map_err(|source| HostVcsError::SpawnFailed { command: command_label.clone(), source })?;
        if !status.success() {
            return Err(HostVcsError::NonZeroExit {
                command: command_label,
                status: status.code().unwrap_or(-1),
            });
        }

        Ok(output)
    }

    /// Send a kill signal to the child and wait for it to exit. Waiting
    /// after a kill must never hang; `Child::wait` returns once the
    /// process has actually been reaped.
    pub async fn terminate(mut self) -> Result<(), HostVcsError> {
        self.child
            .kill()
            .await
            .map_err(|source| HostVcsError::SpawnFailed { command: self.command_label.clone(), source })?;
        self.child
            .wait()
            .await
            .map_err(|source| HostVcsError::SpawnFailed { command: self.command_label, source })?;
        Ok(())
    }
}

/// Run `future` to completion, but kill and reap `child` if a terminating
/// signal arrives first. Every [`ProcessChannel::exchange`] call races
/// against this, so any host-VCS invocation — including the batched
/// `checkout` calls a `lock`/`unlock` issues — is signalled through and
/// never left as an orphan if the parent process is asked to stop.
async fn run_until_signalled<F, T>(future: F, child: &mut Child, command_label: &str) -> Result<T, HostVcsError>
where
    F: std::future::Future<Output = Result<T, HostVcsError>>,
{
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|source| HostVcsError::SpawnFailed { command: "signal".into(), source })?;
        tokio::select! {
            result = future => result,
            _ = sigterm.recv() => {
                child.start_kill().map_err(|source| HostVcsError::SpawnFailed {
                    command: command_label.to_string(),
                    source,
                })?;
                child.wait().await.map_err(|source| HostVcsError::SpawnFailed {
                    command: command_label.to_string(),
                    source,
                })?;
                Err(HostVcsError::ProtocolViolation {
                    command: command_label.to_string(),
                    detail: "terminated by signal".into(),
                })
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (child, command_label);
        future.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exchange_echoes_stdin_to_stdout() {
        let channel = ProcessChannel::spawn("cat", &[]).unwrap();
        let output = channel.exchange(b"hello through the pipe".to_vec()).await.unwrap();
        assert_eq!(output, b"hello through the pipe");
    }

    #[tokio::test]
    async fn exchange_survives_output_larger_than_pipe_buffer() {
        let channel = ProcessChannel::spawn("cat", &[]).unwrap();
        let big_input = vec![0x41u8; 4 * 1024 * 1024];
        let output = channel.exchange(big_input.clone()).await.unwrap();
        assert_eq!(output, big_input);
    }

    #[tokio::test]
    async fn exchange_reports_non_zero_exit() {
        let channel = ProcessChannel::spawn("false", &[]).unwrap();
        let err = channel.exchange(Vec::new()).await.unwrap_err();
        assert!(matches!(err, HostVcsError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = ProcessChannel::spawn("definitely-not-a-real-binary", &[]).unwrap_err();
        assert!(matches!(err, HostVcsError::SpawnFailed { .. }));
    }
}
