use std::io::{Read, Seek};
use std::process::Command;

use color_eyre::eyre::{eyre, Context, Result};

/// Output of a child process run with stderr captured, for callers
/// that need to classify failures by stderr content (e.g. telling a
/// "drive not empty" condition apart from a real fault).
#[derive(Debug)]
pub struct CapturedOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process, returning an error (carrying the
    /// tail of stderr) if it exits abnormally.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string.
    /// Uses `run` internally and fails if the child exits abnormally.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process and hand back exit status plus both
    /// streams without judging success. The caller classifies.
    fn run_captured(&mut self) -> Result<CapturedOutput>;
}

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
    let mut buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut buf))
    {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        let status = self.status()?;
        if status.success() {
            return Ok(());
        }
        let stderr_buf = last_utf8_content_from_file(stderr);
        Err(eyre!("Subprocess failed: {status:?}\n{stderr_buf}"))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut s = String::new();
        stdout.read_to_string(&mut s)?;
        Ok(s)
    }

    fn run_captured(&mut self) -> Result<CapturedOutput> {
        tracing::trace!("exec (captured): {self:?}");
        let output = self.output().context("spawning child")?;
        Ok(CapturedOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
