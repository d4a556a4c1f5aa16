/*
    Marty386
    x86 instruction emulation core

    Copyright 2025 The Marty386 Authors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    ---------------------------------------------------------------------------

    tracelogger.rs

    The instruction trace sink.

    A backend owns its TraceLogger outright rather than borrowing a writer. Lines
    go to a buffered file, to stdout, or to an in-memory buffer that callers
    can drain.

*/

use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

#[derive(Debug, Default)]
pub enum TraceLogger {
    FileWriter(BufWriter<File>),
    Console,
    /// Collects lines in memory.
    Buffer(Vec<String>),
    #[default]
    None,
}

impl TraceLogger {
    /// Open `filename` for tracing. A file that cannot be created is logged and tracing stays off.
    pub fn from_filename<S: AsRef<Path>>(filename: S) -> Self {
        let path = filename.as_ref();
        match File::create(path) {
            Ok(file) => TraceLogger::FileWriter(BufWriter::new(file)),
            Err(e) => {
                log::error!("Couldn't create cpu trace file {}: {}", path.display(), e);
                TraceLogger::None
            }
        }
    }

    pub fn buffer() -> Self {
        TraceLogger::Buffer(Vec::new())
    }

    #[inline(always)]
    pub fn println<S: AsRef<str>>(&mut self, msg: S) {
        if let Err(e) = self.write_line(msg.as_ref()) {
            log::error!("Trace write failed, disabling trace: {}", e);
            *self = TraceLogger::None;
        }
    }

    pub fn println_fmt(&mut self, args: fmt::Arguments<'_>) {
        match self {
            TraceLogger::None => {}
            _ => self.println(args.to_string()),
        }
    }

    fn write_line(&mut self, msg: &str) -> io::Result<()> {
        match self {
            TraceLogger::FileWriter(buf) => {
                buf.write_all(msg.as_bytes())?;
                buf.write_all(b"\n")
            }
            TraceLogger::Console => {
                println!("{}", msg);
                Ok(())
            }
            TraceLogger::Buffer(lines) => {
                lines.push(msg.to_string());
                Ok(())
            }
            TraceLogger::None => Ok(()),
        }
    }

    /// Remove and return the lines collected so far. Empty for every other sink.
    pub fn take_lines(&mut self) -> Vec<String> {
        match self {
            TraceLogger::Buffer(lines) => std::mem::take(lines),
            _ => Vec::new(),
        }
    }

    pub fn flush(&mut self) {
        if let TraceLogger::FileWriter(file) = self {
            if let Err(e) = file.flush() {
                log::error!("Failed to flush trace log: {}", e);
            }
        }
    }

    #[inline(always)]
    pub fn is_some(&self) -> bool {
        !matches!(*self, TraceLogger::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_collects_lines() {
        let mut logger = TraceLogger::buffer();
        assert!(logger.is_some());
        logger.println("0000:00000100 nop");
        logger.println_fmt(format_args!("{:04X}:{:08X} {}", 0, 0x101, "hlt"));
        assert_eq!(logger.take_lines(), ["0000:00000100 nop", "0000:00000101 hlt"]);
        assert!(logger.take_lines().is_empty());
    }

    #[test]
    fn test_none_discards() {
        let mut logger = TraceLogger::default();
        assert!(!logger.is_some());
        logger.println("dropped");
        assert!(logger.take_lines().is_empty());
    }

    #[test]
    fn test_bad_path_disables() {
        let logger = TraceLogger::from_filename("/nonexistent-directory/trace.log");
        assert!(!logger.is_some());
    }
}
