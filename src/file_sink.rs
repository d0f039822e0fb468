use chrono::{DateTime, TimeZone};
use log::{info, warn};
use std::{
    fmt::Display,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
/// Reasons the raw data log file could not be set up
pub enum FileSinkError {
    /// The configured directory is missing
    #[error("Can't log raw data to file. Directory \"{}\" does not exist.", .0.display())]
    DirNotFound(PathBuf),
    /// The configured path exists but is something else
    #[error("Can't log raw data to file. \"{}\" exists, but is not a directory.", .0.display())]
    NotADirectory(PathBuf),
    /// The log file could not be created
    #[error("Can't log raw data to file. Can't create file \"{}\": {source}", .path.display())]
    Create {
        /// Log file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

/// Name of the log file for a session started at `tstamp`: `YYYY_MM_DD_HHMM.log`
pub fn log_file_name<Tz: TimeZone>(tstamp: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    tstamp.format("%Y_%m_%d_%H%M.log").to_string()
}

/// Append-only sink for the raw receiver stream.
///
/// Bytes are written verbatim, without framing, through a buffered writer.
/// Nothing is flushed per chunk; the buffer is flushed on [`FileSink::flush`]
/// and on drop.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    accepted: u64,
    written: u64,
}

impl FileSink {
    /// Create (or truncate) the log file for a session started at `tstamp`
    /// inside `dir`. `dir` must be an existing directory.
    pub fn open<Tz: TimeZone>(dir: &Path, tstamp: &DateTime<Tz>) -> Result<Self, FileSinkError>
    where
        Tz::Offset: Display,
    {
        let meta =
            std::fs::metadata(dir).map_err(|_| FileSinkError::DirNotFound(dir.to_path_buf()))?;
        if !meta.is_dir() {
            return Err(FileSinkError::NotADirectory(dir.to_path_buf()));
        }
        let path = dir.join(log_file_name(tstamp));
        let file = File::create(&path).map_err(|source| FileSinkError::Create {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            accepted: 0,
            written: 0,
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes handed to [`FileSink::write`], buffered ones included
    pub fn bytes_accepted(&self) -> u64 {
        self.accepted
    }

    /// Total bytes that reached the file
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append a chunk
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.accepted += data.len() as u64;
        self.settle();
        Ok(())
    }

    /// Push buffered bytes to the file
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        self.settle();
        Ok(())
    }

    /// Everything accepted and no longer in the buffer has been written
    fn settle(&mut self) {
        let pending = self.writer.buffer().len() as u64;
        self.written = self.written.max(self.accepted.saturating_sub(pending));
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Error writing to file {:?}: {e}", self.path);
        }
        info!("Closed {:?} after {} bytes", self.path, self.written);
    }
}
