//! Helpers intended for [`tokio::process::Command`] and related structures.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::io::{Read, Seek};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Parse the last chunk (e.g. 1024 bytes) from the provided file,
/// ensure it's UTF-8, and return that value. This function is infallible;
/// if the file cannot be read for some reason, a copy of a static string
/// is returned.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut stderr_buf = Vec::with_capacity(size.into());
    let r = match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    };
    r.trim_end().to_owned()
}

fn check_status(
    cmd: &Command,
    status: std::process::ExitStatus,
    stderr: std::fs::File,
) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let stderr_buf = last_utf8_content_from_file(stderr);
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    if stderr_buf.is_empty() {
        Err(Error::Process(format!("{program} failed: {status}")))
    } else {
        Err(Error::Process(stderr_buf))
    }
}

fn spawn_error(cmd: &Command, e: std::io::Error) -> Error {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    Error::Process(format!("Failed to execute {program}: {e}"))
}

/// Helpers intended for [`tokio::process::Command`].
#[allow(async_fn_in_trait)]
pub trait AsyncCommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Asynchronously execute the child, and return an error if the child exited unsuccessfully.
    async fn run(&mut self) -> Result<()>;

    /// Execute the child and capture its stdout as (lossy) UTF-8.
    async fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child with `input` written to its stdin.
    async fn run_with_stdin(&mut self, input: &[u8]) -> Result<()>;
}

impl AsyncCommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        // We unconditionally log at trace level, so avoid double logging
        if !tracing::enabled!(tracing::Level::TRACE) {
            tracing::debug!("exec: {:?}", self.as_std());
        }
        self
    }

    async fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        self.stdin(Stdio::null());
        tracing::trace!("exec: {:?}", self.as_std());
        let status = self.status().await.map_err(|e| spawn_error(self, e))?;
        check_status(self, status, stderr)
    }

    async fn run_get_string(&mut self) -> Result<String> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        self.stdin(Stdio::null());
        self.stdout(Stdio::piped());
        tracing::trace!("exec: {:?}", self.as_std());
        let output = self.output().await.map_err(|e| spawn_error(self, e))?;
        check_status(self, output.status, stderr)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_with_stdin(&mut self, input: &[u8]) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        self.stdin(Stdio::piped());
        tracing::trace!("exec: {:?}", self.as_std());
        let mut child = self.spawn().map_err(|e| spawn_error(self, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            // Close stdin so the child sees EOF
            drop(stdin);
        }
        let status = child.wait().await?;
        check_status(self, status, stderr)
    }
}
