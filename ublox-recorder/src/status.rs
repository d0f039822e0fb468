use chrono::Local;
use crossterm::terminal;
use std::{
    io::Write,
    time::{Duration, Instant},
};

/// Single line throughput report, refreshed at most once per second
pub struct Status {
    last_print: Instant,
    chunks: u64,
    bytes: u64,
    printed: bool,
}

impl Status {
    pub fn new() -> Self {
        Self {
            last_print: Instant::now(),
            chunks: 0,
            bytes: 0,
            printed: false,
        }
    }

    pub fn record(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len as u64;
    }

    pub fn print(&mut self, logged: u64) {
        if self.last_print.elapsed() < Duration::from_secs(1) {
            return;
        }
        self.last_print = Instant::now();
        let width = terminal::size().map(|(w, _)| w as usize).unwrap_or(80);
        let line = format!(
            "[{}] {} chunks, {} bytes in, {} bytes logged",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.chunks,
            self.bytes,
            logged
        );
        print!("\r{:<width$}", line, width = width.saturating_sub(1));
        let _ = std::io::stdout().flush();
        self.printed = true;
    }

    pub fn finish(&self) {
        if self.printed {
            println!();
        }
    }
}
