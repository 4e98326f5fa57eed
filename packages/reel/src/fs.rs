//! File system routines

use std::fs::File;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Context, ErrorContext as _, Resume, Routine, Step, Value};

/// Routine that reads a file in chunks of `chunk` bytes.
///
/// If `delay` is not zero, it sleeps that long before each chunk. Each chunk
/// is emitted as [`Value::Bytes`], and the routine returns the total number of bytes.
///
/// Reads are small and synchronous. Wrap it with
/// [`ensure_async`](crate::ensure_async) and [`Ensure::thread`](crate::Ensure)
/// to keep the driver thread free while reading slow files.
pub fn read_chunks(path: impl AsRef<Path>, chunk: usize, delay: Duration) -> ReadChunks {
    ReadChunks {
        path: path.as_ref().to_path_buf(),
        chunk: chunk.max(1),
        delay,
        file: None,
        pending: None,
        count: 0,
    }
}

pub struct ReadChunks {
    path: PathBuf,
    chunk: usize,
    delay: Duration,
    file: Option<File>,
    /// Chunk read and waiting for the delay to pass
    pending: Option<Vec<u8>>,
    count: usize,
}

impl ReadChunks {
    fn read_next(&mut self) -> crate::Result<Vec<u8>> {
        let file = match self.file.take() {
            Some(file) => file,
            None => crate::check!(
                File::open(&self.path),
                "failed to open '{}'",
                self.path.display()
            )?,
        };
        let file = self.file.insert(file);
        let mut buf = Vec::with_capacity(self.chunk);
        crate::check!(
            file.take(self.chunk as u64).read_to_end(&mut buf),
            "failed to read '{}'",
            self.path.display()
        )?;
        Ok(buf)
    }
}

impl Routine for ReadChunks {
    fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
        if let Resume::Error(e) = input {
            return Step::Raise(e);
        }
        // the delay before this chunk has passed
        if let Some(data) = self.pending.take() {
            return Step::emit(data);
        }
        let data = match self.read_next() {
            Ok(data) => data,
            Err(e) => return Step::raise(e),
        };
        if data.is_empty() {
            crate::debug!("read {} byte(s) from '{}'", self.count, self.path.display());
            self.file = None;
            return Step::ret(self.count);
        }
        self.count += data.len();
        if self.delay.is_zero() {
            return Step::emit(data);
        }
        self.pending = Some(data);
        crate::sleep(self.delay).into()
    }

    fn name(&self) -> &str {
        "read_chunks"
    }
}
