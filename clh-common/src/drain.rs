//! Background output draining.
//!
//! A child process (or remote channel) that fills its pipe buffer stops
//! making progress, and a synchronous waiter on it deadlocks. Every captured
//! stream therefore gets its own detached thread that copies it into a sink
//! until the stream closes.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

const CHUNK_SIZE: usize = 8192;

/// Where drained output goes.
pub enum DrainSink {
    /// Raw bytes into a file; the file is closed when the source ends.
    File(File),
    /// This process's stdout, flushed per line.
    Stdout,
    /// This process's stderr, flushed per line.
    Stderr,
    /// Any writer, flushed per line.
    Writer(Box<dyn Write + Send>),
}

impl std::fmt::Debug for DrainSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Stdout => f.write_str("Stdout"),
            Self::Stderr => f.write_str("Stderr"),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Counters reported when a drain finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub bytes: u64,
    pub chunks: u64,
    /// Chunks written only after lossy UTF-8 re-encoding.
    pub lossy_chunks: u64,
    /// Chunks that could not be written at all.
    pub dropped_chunks: u64,
}

/// Spawn a named thread copying `source` into `sink` until EOF.
///
/// The handle may be dropped; the thread ends when the source closes.
pub fn spawn_drain<R>(name: &str, source: R, sink: DrainSink) -> io::Result<JoinHandle<DrainStats>>
where
    R: Read + Send + 'static,
{
    let label = name.to_string();
    thread::Builder::new()
        .name(format!("drain-{name}"))
        .spawn(move || {
            let stats = match sink {
                DrainSink::File(file) => drain_raw(source, file),
                DrainSink::Stdout => drain_lines(source, io::stdout()),
                DrainSink::Stderr => drain_lines(source, io::stderr()),
                DrainSink::Writer(writer) => drain_lines(source, writer),
            };
            debug!(
                drain = %label,
                bytes = stats.bytes,
                lossy = stats.lossy_chunks,
                dropped = stats.dropped_chunks,
                "drain finished"
            );
            stats
        })
}

fn drain_raw<R: Read, W: Write>(mut source: R, mut sink: W) -> DrainStats {
    let mut stats = DrainStats::default();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                trace!(error = %err, "drain source closed with error");
                break;
            }
        };
        stats.chunks += 1;
        let (written, result) = write_resuming(&mut sink, &buf[..n]);
        stats.bytes += written as u64;
        if let Err(err) = result {
            trace!(error = %err, written, "drain sink failed mid-chunk, dropping the rest");
            stats.dropped_chunks += 1;
        }
    }
    let _ = sink.flush();
    stats
}

/// Write `chunk`, resuming after one failed write from the first unwritten
/// byte. Returns how many bytes reached the sink.
fn write_resuming<W: Write>(sink: &mut W, chunk: &[u8]) -> (usize, io::Result<()>) {
    let mut written = 0;
    let mut retried = false;
    while written < chunk.len() {
        match sink.write(&chunk[written..]) {
            Ok(0) => return (written, Err(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) if !retried => retried = true,
            Err(err) => return (written, Err(err)),
        }
    }
    (written, Ok(()))
}

fn drain_lines<R: Read, W: Write>(source: R, mut sink: W) -> DrainStats {
    let mut stats = DrainStats::default();
    let mut warned = false;
    let mut reader = BufReader::new(source);
    let mut line = Vec::new();
    loop {
        line.clear();
        // Keeps the delimiter, so a last line without one is relayed as is.
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                trace!(error = %err, "drain source closed with error");
                break;
            }
        }
        stats.chunks += 1;

        let first = match std::str::from_utf8(&line) {
            Ok(text) => write_flush(&mut sink, text.as_bytes()),
            Err(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8")),
        };
        if first.is_ok() {
            stats.bytes += line.len() as u64;
            continue;
        }

        // Retry once with a permissive re-encoding, then give up on this chunk.
        let lossy = String::from_utf8_lossy(&line).into_owned();
        match write_flush(&mut sink, lossy.as_bytes()) {
            Ok(()) => {
                stats.lossy_chunks += 1;
                stats.bytes += lossy.len() as u64;
            }
            Err(err) => {
                stats.dropped_chunks += 1;
                if !warned {
                    warn!(error = %err, "drain sink rejected output, dropping chunk");
                    warned = true;
                }
            }
        }
    }
    stats
}

fn write_flush<W: Write>(sink: &mut W, bytes: &[u8]) -> io::Result<()> {
    sink.write_all(bytes)?;
    sink.flush()
}
