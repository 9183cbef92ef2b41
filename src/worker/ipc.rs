//! Newline-delimited JSON framing over pipes.
//!
//! Process workers and their coordinator exchange exactly one protocol message per
//! line. [`PipeFd`] is the raw endpoint; [`LineReader`] and [`LineWriter`] add
//! buffering and the framing.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Buffer size for both directions.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// One end of a pipe, owning its descriptor.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Take ownership of an inherited descriptor such as stdin or stdout.
    ///
    /// # Safety
    /// `fd` must be open and not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self::new(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl From<std::process::ChildStdin> for PipeFd {
    fn from(stdin: std::process::ChildStdin) -> Self {
        Self::new(stdin.into())
    }
}

impl From<std::process::ChildStdout> for PipeFd {
    fn from(stdout: std::process::ChildStdout) -> Self {
        Self::new(stdout.into())
    }
}

/// Repeat a syscall until it is not interrupted by a signal.
fn retry_eintr(mut op: impl FnMut() -> nix::Result<usize>) -> io::Result<usize> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::read(&self.fd, buf))
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::write(&self.fd, buf))
    }

    // Unbuffered; BufWriter above does the buffering
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered line reader for IPC.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line_buffer: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER_SIZE, fd),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        match self.reader.read_line(&mut self.line_buffer)? {
            0 => Ok(None),
            _ => {
                if self.line_buffer.ends_with('\n') {
                    self.line_buffer.pop();
                }
                if self.line_buffer.ends_with('\r') {
                    self.line_buffer.pop();
                }
                Ok(Some(&self.line_buffer))
            }
        }
    }

    /// Read the next non-empty line and decode it as one message.
    ///
    /// Returns `None` on EOF. A line that does not decode is an `InvalidData` error;
    /// the reader stays usable afterwards.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        }
    }
}

/// Buffered line writer for IPC.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    /// Encode one message as a JSON line and flush.
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.write_line(&json)
    }
}
