use log::info;
use serialport::SerialPort;
use std::{
    io::{ErrorKind, Read},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
/// Errors raised by a raw data source
pub enum DeviceError {
    /// The serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    /// Reading from the source failed
    #[error("Error reading raw data: {0}")]
    Io(#[from] std::io::Error),
}

/// A receiver attached to a serial port
pub struct SerialSource {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialSource {
    /// Open `path` at `baud_rate`. Reads return after `timeout` without data.
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, DeviceError> {
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        info!("Opened {path} at {baud_rate} baud");
        Ok(Self {
            name: path.into(),
            port,
        })
    }

    /// Name of the serial device
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read until `stop` is set, handing every chunk to `on_chunk` as soon as
    /// it arrives. A read that times out without data is not an error.
    /// Returns the number of bytes read.
    pub fn run<F: FnMut(&[u8])>(
        &mut self,
        stop: &AtomicBool,
        on_chunk: F,
    ) -> Result<u64, DeviceError> {
        run_reader(&mut self.port, stop, on_chunk)
    }
}

/// Read `reader` to its end (or until `stop` is set), handing every chunk to
/// `on_chunk`. Reads go through a fixed buffer, so `stop` is checked between
/// chunks even when data never pauses. Timeouts are retried. Chunks delivered
/// before an error are not lost. Returns the number of bytes read.
pub fn run_reader<R, F>(
    reader: &mut R,
    stop: &AtomicBool,
    mut on_chunk: F,
) -> Result<u64, DeviceError>
where
    R: Read + ?Sized,
    F: FnMut(&[u8]),
{
    let mut total = 0u64;
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                on_chunk(&buf[..n]);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    /// Replays a script of read results
    struct Scripted(Vec<std::io::Result<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let data = self.0.remove(0)?;
            buf[..data.len()].copy_from_slice(&data);
            Ok(data.len())
        }
    }

    #[test]
    fn test_reader_to_eof() {
        let data: Vec<u8> = (0..10_000u32).map(|x| x as u8).collect();
        let mut rd = Cursor::new(data.clone());
        let stop = AtomicBool::new(false);
        let mut out = Vec::new();
        let mut chunks = 0;
        let n = run_reader(&mut rd, &stop, |chunk| {
            chunks += 1;
            out.extend_from_slice(chunk);
        })
        .unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(out, data);
        assert_eq!(chunks, 3);
    }

    #[test]
    fn test_reader_skips_timeouts() {
        let mut rd = Scripted(vec![
            Err(ErrorKind::TimedOut.into()),
            Ok(b"abc".to_vec()),
            Err(ErrorKind::Interrupted.into()),
            Ok(b"def".to_vec()),
        ]);
        let stop = AtomicBool::new(false);
        let mut out = Vec::new();
        run_reader(&mut rd, &stop, |chunk| out.extend_from_slice(chunk)).unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_reader_error() {
        let mut rd = Scripted(vec![
            Ok(b"abc".to_vec()),
            Err(ErrorKind::BrokenPipe.into()),
        ]);
        let stop = AtomicBool::new(false);
        let mut out = Vec::new();
        let res = run_reader(&mut rd, &stop, |chunk| out.extend_from_slice(chunk));
        assert!(matches!(res, Err(DeviceError::Io(ref e)) if e.kind() == ErrorKind::BrokenPipe));
        assert_eq!(out, b"abc");
    }

    /// Never pauses, never ends
    struct Endless;

    impl Read for Endless {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            buf.fill(0xb5);
            Ok(buf.len())
        }
    }

    #[test]
    fn test_reader_stops_continuous_stream() {
        let stop = AtomicBool::new(false);
        let mut chunks = 0;
        let n = run_reader(&mut Endless, &stop, |chunk| {
            assert!(!chunk.is_empty());
            chunks += 1;
            if chunks == 3 {
                stop.store(true, Ordering::Relaxed);
            }
        })
        .unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(n, 3 * 4096);
    }

    #[test]
    fn test_reader_stop() {
        let mut rd = Cursor::new(vec![1u8; 100]);
        let stop = AtomicBool::new(true);
        let n = run_reader(&mut rd, &stop, |_| panic!("no data expected")).unwrap();
        assert_eq!(n, 0);
    }
}
