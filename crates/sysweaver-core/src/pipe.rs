//! Pipe plumbing between the host and jailed processes

use crate::{JailError, LogSink, Result};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::io::FromRawFd;
use std::thread::JoinHandle;

/// Size of a single read from a jailed process' output.
const CHUNK_SIZE: usize = 8 * 1024;

/// Create a close-on-exec pipe (returns read end, write end)
pub fn create_pipe() -> Result<(File, File)> {
    let mut fds = [0i32; 2];

    // SAFETY: pipe2 syscall
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    if ret != 0 {
        return Err(JailError::Io(std::io::Error::last_os_error()));
    }

    // SAFETY: We just created these file descriptors
    let read_end = unsafe { File::from_raw_fd(fds[0]) };
    let write_end = unsafe { File::from_raw_fd(fds[1]) };

    Ok((read_end, write_end))
}

/// Read `reader` until EOF, handing every chunk to `on_chunk`.
///
/// Returns the number of bytes seen. A read error ends the pump early; the
/// writer side is gone in that case anyway.
pub fn pump(mut reader: impl Read, mut on_chunk: impl FnMut(&[u8])) -> u64 {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                on_chunk(&buf[..n]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
    total
}

/// Forward everything written to `reader` into `sink` on a background thread.
pub fn forward_to_sink(reader: File, sink: LogSink) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("jail-output".into())
        .spawn(move || {
            let mut warned = false;
            let total = pump(reader, |chunk| {
                if let Err(e) = sink.write_all(chunk) {
                    if !warned {
                        tracing::warn!(error = %e, "log sink rejected jail output");
                        warned = true;
                    }
                }
            });
            tracing::trace!(bytes = total, "jail output forwarder finished");
        })
        .map_err(JailError::Io)
}
