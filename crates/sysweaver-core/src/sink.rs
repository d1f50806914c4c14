//! Shared log destination for jail output

use parking_lot::Mutex;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

/// Writer that jail output is forwarded to.
///
/// Clones share the same underlying writer, so replacing it with
/// [`LogSink::replace`] redirects every forwarder, including the one
/// attached to an already running confined shell.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    #[must_use]
    pub fn null() -> Self {
        Self::new(io::sink())
    }

    /// Append to `path`, creating it if needed.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }

    pub fn replace(&self, writer: impl Write + Send + 'static) {
        *self.inner.lock() = Box::new(writer);
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock();
        writer.write_all(buf)?;
        writer.flush()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}
