//! Observation output streams.
//!
//! Observations write plain text, one value per line. A composite
//! observation writes `timestamp, dec, a, b` to a single file; a dual-stream
//! observation writes `timestamp, dec, a` and `timestamp, dec, b` to parallel
//! A and B files. A lone `*` line marks a phase boundary. When the
//! observation completes, a metadata block is appended and the files closed.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use tracing::debug;

use super::ObservationKind;
use crate::measurement::CalibratedPoint;

/// Phase boundary marker.
pub const SEPARATOR: &str = "*";

/// Ordered, newline-delimited text sink.
pub trait LineSink: Send {
    /// Append one line.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Push buffered lines to the backing store.
    fn flush(&mut self) -> io::Result<()>;

    /// Flush and release the backing store. Later writes fail.
    fn close(&mut self) -> io::Result<()>;
}

/// Buffered file sink.
pub struct FileLineSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileLineSink {
    /// Create (truncate) `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let writer = BufWriter::new(File::create(&path)?);
        debug!(path = %path.display(), "Opened observation file");
        Ok(Self {
            path,
            writer: Some(writer),
        })
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "observation file already closed"))
    }
}

impl LineSink for FileLineSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let writer = self.writer()?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryLines {
    lines: Vec<String>,
    closed: bool,
}

/// In-memory sink; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryLines>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().lines.clone()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl LineSink for MemorySink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        inner.lines.push(line.to_string());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

/// File extension for an observation kind: single declination or region sweep.
pub fn extension(kind: ObservationKind) -> &'static str {
    match kind {
        ObservationKind::Scan | ObservationKind::Spectrum => "md1",
        ObservationKind::Survey => "md2",
    }
}

/// File names an observation writes, composite first or A then B.
pub fn file_names(name: &str, kind: ObservationKind, composite: bool) -> Vec<String> {
    let ext = extension(kind);
    if composite {
        vec![format!("{}_comp.{}", name, ext)]
    } else {
        vec![format!("{}_a.{}", name, ext), format!("{}_b.{}", name, ext)]
    }
}

/// Trailing block identifying the telescope and the observing interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationMetadata {
    /// Telescope name
    pub telescope: String,
    /// Observation name
    pub observation: String,
    /// Unix seconds when the observation began
    pub started_at: f64,
    /// Unix seconds when the observation completed
    pub stopped_at: f64,
}

impl ObservationMetadata {
    /// The six metadata lines, dates and times in local time.
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("TELESCOPE: {}", self.telescope),
            format!("OBSERVATION: {}", self.observation),
            format!("LOCAL START DATE: {}", local_format(self.started_at, "%m/%d/%Y")),
            format!("LOCAL START TIME: {}", local_format(self.started_at, "%I:%M:%S %p")),
            format!("LOCAL STOP DATE: {}", local_format(self.stopped_at, "%m/%d/%Y")),
            format!("LOCAL STOP TIME: {}", local_format(self.stopped_at, "%I:%M:%S %p")),
        ]
    }
}

fn local_format(epoch: f64, pattern: &str) -> String {
    match Local.timestamp_opt(epoch.floor() as i64, 0).single() {
        Some(local) => local.format(pattern).to_string(),
        None => String::from("unknown"),
    }
}

/// Where an observation's lines go.
pub enum ObservationOutput {
    /// One interleaved stream.
    Composite(Box<dyn LineSink>),
    /// Parallel per-channel streams.
    Dual {
        /// Channel A stream
        a: Box<dyn LineSink>,
        /// Channel B stream
        b: Box<dyn LineSink>,
    },
}

impl std::fmt::Debug for ObservationOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationOutput::Composite(_) => write!(f, "ObservationOutput::Composite"),
            ObservationOutput::Dual { .. } => write!(f, "ObservationOutput::Dual"),
        }
    }
}

impl ObservationOutput {
    /// Create the observation's files under `dir`.
    pub fn create(dir: &Path, name: &str, kind: ObservationKind, composite: bool) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut paths = file_names(name, kind, composite).into_iter().map(|file| dir.join(file));
        let mut open = || -> io::Result<Box<dyn LineSink>> {
            let path = paths
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing output file name"))?;
            Ok(Box::new(FileLineSink::create(path)?))
        };
        Ok(if composite {
            ObservationOutput::Composite(open()?)
        } else {
            ObservationOutput::Dual {
                a: open()?,
                b: open()?,
            }
        })
    }

    /// Whether this is a single composite stream.
    pub fn is_composite(&self) -> bool {
        matches!(self, ObservationOutput::Composite(_))
    }

    /// Write `line` to every stream.
    pub fn write_all(&mut self, line: &str) -> io::Result<()> {
        match self {
            ObservationOutput::Composite(sink) => sink.write_line(line),
            ObservationOutput::Dual { a, b } => {
                a.write_line(line)?;
                b.write_line(line)
            }
        }
    }

    /// Write a phase boundary.
    pub fn separator(&mut self) -> io::Result<()> {
        self.write_all(SEPARATOR)
    }

    /// Write one calibrated point.
    pub fn write_point(&mut self, point: &CalibratedPoint) -> io::Result<()> {
        self.write_all(&format!("{:.2}", point.timestamp))?;
        self.write_all(&format!("{:.2}", point.dec))?;
        match self {
            ObservationOutput::Composite(sink) => {
                sink.write_line(&format!("{:.4}", point.a))?;
                sink.write_line(&format!("{:.4}", point.b))
            }
            ObservationOutput::Dual { a, b } => {
                a.write_line(&format!("{:.4}", point.a))?;
                b.write_line(&format!("{:.4}", point.b))
            }
        }
    }

    /// Append the closing block: two separators then the metadata lines.
    pub fn write_metadata(&mut self, metadata: &ObservationMetadata) -> io::Result<()> {
        self.separator()?;
        self.separator()?;
        for line in metadata.lines() {
            self.write_all(&line)?;
        }
        Ok(())
    }

    /// Flush every stream.
    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            ObservationOutput::Composite(sink) => sink.flush(),
            ObservationOutput::Dual { a, b } => {
                a.flush()?;
                b.flush()
            }
        }
    }

    /// Flush and close every stream.
    pub fn close(&mut self) -> io::Result<()> {
        match self {
            ObservationOutput::Composite(sink) => sink.close(),
            ObservationOutput::Dual { a, b } => {
                a.close()?;
                b.close()
            }
        }
    }
}
