//! External decode process.
//!
//! The decoder reads the upstream channel, copies its elementary streams and
//! writes an MPEG-TS byte stream to stdout. Each [`DecodeProcess`] is owned
//! by exactly one live session and torn down through
//! [`DecodeProcess::shutdown`].

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Placeholder in the argument template replaced by the upstream URL.
pub const URL_PLACEHOLDER: &str = "[URL]";

/// stderr fragments after which the decoder cannot recover.
const FATAL_STDERR_PATTERNS: &[&str] = &[
    "Invalid data found when processing input",
    "Server returned 4",
    "Server returned 5",
    "Connection refused",
    "Connection timed out",
    "No such file or directory",
];

/// Whether a decoder stderr line reports an unrecoverable input error.
pub fn is_fatal_stderr(line: &str) -> bool {
    FATAL_STDERR_PATTERNS
        .iter()
        .any(|pattern| line.contains(pattern))
}

/// Program and argument template used to start decoders
#[derive(Clone, Debug)]
pub struct DecoderCommand {
    program: String,
    args: Vec<String>,
}

/// Output pipes of a freshly spawned decoder
#[derive(Debug)]
pub struct DecoderPipes {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl DecoderCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument list for `url`, with every placeholder substituted.
    pub fn args_for(&self, url: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(URL_PLACEHOLDER, url))
            .collect()
    }

    /// Spawn a decoder reading `url`.
    ///
    /// stdin is closed, stdout and stderr are piped. The child is killed if
    /// the returned handle is dropped without [`DecodeProcess::shutdown`].
    pub fn spawn(&self, url: &str) -> io::Result<(DecodeProcess, DecoderPipes)> {
        let args = self.args_for(url);
        debug!("Spawning decoder: {} {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("decoder stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("decoder stderr was not captured"))?;

        info!(
            "Started decoder {} (pid {:?}) for {}",
            self.program,
            child.id(),
            url
        );

        Ok((DecodeProcess { child }, DecoderPipes { stdout, stderr }))
    }
}

/// Running decoder child process
#[derive(Debug)]
pub struct DecodeProcess {
    child: Child,
}

impl DecodeProcess {
    /// Wait up to `grace` for the decoder to exit, then force-kill it.
    ///
    /// Callers drop the stdout pipe first: the decoder fails its next write
    /// and exits on its own, which is the graceful path.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        let pid = self.child.id();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Decoder (pid {:?}) exited with {}", pid, status);
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("Error waiting for decoder (pid {:?}): {}", pid, e);
                None
            }
            Err(_) => {
                warn!(
                    "Decoder (pid {:?}) still running after {:?}, killing",
                    pid, grace
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill decoder (pid {:?}): {}", pid, e);
                }
                self.child.try_wait().ok().flatten()
            }
        }
    }
}
