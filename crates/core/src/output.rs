//! Output sinks for supervised processes
//!
//! By default children inherit the supervisor's stdio. When custom writers are
//! installed (tests, embedding) output is piped and copied line by line.
//! Prefixed sidecar output is always piped so each line can be tagged.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::warn;

/// Shared, thread-safe writer
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Writers supervised process output is copied to
#[derive(Clone)]
pub struct OutputSinks {
    stdout: SharedWriter,
    stderr: SharedWriter,
    inherit: bool,
}

impl std::fmt::Debug for OutputSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSinks")
            .field("inherit", &self.inherit)
            .finish()
    }
}

impl Default for OutputSinks {
    fn default() -> Self {
        Self::stdio()
    }
}

impl OutputSinks {
    /// The supervisor's own stdout and stderr
    pub fn stdio() -> Self {
        Self {
            stdout: Arc::new(Mutex::new(io::stdout())),
            stderr: Arc::new(Mutex::new(io::stderr())),
            inherit: true,
        }
    }

    /// Custom writers; unprefixed output is piped into them as well
    pub fn new(stdout: SharedWriter, stderr: SharedWriter) -> Self {
        Self {
            stdout,
            stderr,
            inherit: false,
        }
    }

    /// Whether unprefixed children can share the supervisor's stdio directly
    pub fn inherits_stdio(&self) -> bool {
        self.inherit
    }

    pub fn stdout(&self) -> SharedWriter {
        self.stdout.clone()
    }

    pub fn stderr(&self) -> SharedWriter {
        self.stderr.clone()
    }
}

/// Format one output line
pub fn prefixed_line(prefix: Option<&str>, line: &str) -> String {
    match prefix {
        Some(prefix) => format!("{} {}\n", prefix, line),
        None => format!("{}\n", line),
    }
}

/// Copy `reader` line by line into `sink` on its own task
pub fn spawn_line_drain<R>(reader: R, sink: SharedWriter, prefix: Option<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let text = prefixed_line(prefix.as_deref(), &line);
                    match sink.lock() {
                        Ok(mut out) => {
                            let _ = out.write_all(text.as_bytes());
                            let _ = out.flush();
                        }
                        Err(_) => {
                            warn!("Output sink poisoned, dropping remaining output");
                            return;
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("Failed to read process output: {}", e);
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory writer for assertions
    #[derive(Clone, Default)]
    pub struct Capture(pub Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.0.lock() {
                Ok(mut inner) => inner.write(buf),
                Err(_) => Err(io::Error::new(io::ErrorKind::Other, "poisoned")),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }
}
