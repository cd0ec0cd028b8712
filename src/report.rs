//! CSV reporting of per-message timings.
//!
//! One line per event, no header:
//! - sender: `<message_id>,<send_time_ms>`
//! - receiver: `<message_id>,<send_time_ms>,<receive_time_ms>`
//!
//! The writer is buffered; callers flush once per engine event so a harness
//! tailing the stream sees progress in near real time without paying a
//! syscall per line.

use std::io::{self, BufWriter, Stdout, Write};

pub struct Reporter<W: Write> {
    out: W,
    lines: u64,
    dirty: bool,
}

impl Reporter<BufWriter<Stdout>> {
    /// Reporter writing to the process's standard output.
    pub fn stdout() -> Self {
        Self::new(BufWriter::new(io::stdout()))
    }
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            lines: 0,
            dirty: false,
        }
    }

    /// Record a sent message.
    pub fn sent(&mut self, id: &str, send_time: i64) -> io::Result<()> {
        writeln!(self.out, "{},{}", id, send_time)?;
        self.lines += 1;
        self.dirty = true;
        Ok(())
    }

    /// Record a received message.
    pub fn received(&mut self, id: &str, send_time: i64, receive_time: i64) -> io::Result<()> {
        writeln!(self.out, "{},{},{}", id, send_time, receive_time)?;
        self.lines += 1;
        self.dirty = true;
        Ok(())
    }

    /// Flush if anything was written since the last flush.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            self.out.flush()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Number of lines written so far.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
