//! Running commands inside a jail

use crate::pipe::pump;
use crate::{JailError, LogSink, Result};
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Where a command's output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Forwarded live to the log sink, nothing returned
    Streaming,
    /// Captured (stdout and stderr interleaved) and returned
    Buffered,
}

/// Outcome of a command run inside the jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `128 + signal` when killed by a signal
    pub exit_code: i32,

    /// Combined stdout and stderr, empty in streaming mode
    pub output: Vec<u8>,

    /// Wall-clock duration
    pub duration: Duration,
}

impl CommandOutput {
    /// Get output as UTF-8 string, lossy conversion
    #[must_use]
    pub fn output_str(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Run `command` to completion.
///
/// stdout and stderr are drained by two threads at once so neither pipe
/// can fill up and stall the child; both must reach EOF before the exit
/// status is collected. A non-zero exit becomes [`JailError::Execution`]
/// carrying whatever output was captured.
pub fn run(mut command: Command, program: &str, mode: OutputMode, sink: &LogSink) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut child = match command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return Err(JailError::Execution {
                program: program.to_owned(),
                exit_code: -1,
                output: format!("failed to start {program}: {e}").into_bytes(),
            });
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let captured = Mutex::new(Vec::new());

    let on_chunk = |chunk: &[u8]| match mode {
        OutputMode::Buffered => captured.lock().extend_from_slice(chunk),
        OutputMode::Streaming => {
            if let Err(e) = sink.write_all(chunk) {
                tracing::debug!(error = %e, "log sink rejected command output");
            }
        }
    };

    std::thread::scope(|scope| {
        if let Some(stdout) = stdout {
            scope.spawn(|| pump(stdout, on_chunk));
        }
        if let Some(stderr) = stderr {
            scope.spawn(|| pump(stderr, on_chunk));
        }
    });

    let status = child.wait()?;
    let result = CommandOutput {
        exit_code: exit_code(status),
        output: captured.into_inner(),
        duration: start.elapsed(),
    };

    tracing::debug!(
        program,
        exit_code = result.exit_code,
        bytes = result.output.len(),
        duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        "command finished"
    );

    if result.is_success() {
        Ok(result)
    } else {
        Err(JailError::Execution {
            program: program.to_owned(),
            exit_code: result.exit_code,
            output: result.output,
        })
    }
}

/// Run `command` attached to the caller's terminal.
pub fn run_interactive(mut command: Command, program: &str) -> Result<()> {
    let status = command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(JailError::Execution {
            program: program.to_owned(),
            exit_code: exit_code(status),
            output: Vec::new(),
        })
    }
}
