//! A source is one unit of assembly text that gets linked. Each pass reads the source from the
//! start, so a source hands out any number of readers over its lifetime, but only one at a time.
//! The output, on the other hand, can only be created once. When the source is closed, its backend
//! is told whether output was produced so that it can promote the output to its final location,
//! then the backend gets a chance to clean up regardless of whether that worked.

use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Where the text of a source comes from and where its output goes.
pub trait SourceBackend: Send + Sync {
    /// Opens a fresh reader positioned at the start of the input.
    fn open_input(&self) -> Result<Box<dyn BufRead + Send>>;

    /// Creates the writer for the output. Called at most once.
    fn create_output(&self) -> Result<Box<dyn Write + Send>>;

    /// Called exactly once when the source is closed normally.
    fn finalize(&self, produced_output: bool) -> Result;

    /// Called when the source is closed, after `finalize` if that was called, even if it failed.
    fn cleanup(&self);
}

pub struct Source {
    name: String,
    backend: Box<dyn SourceBackend>,
    state: Mutex<SourceState>,
}

#[derive(Default)]
struct SourceState {
    input_held: bool,
    output: OutputState,
    closed: bool,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum OutputState {
    #[default]
    NotCreated,
    Open,
    Closed,
}

/// A reader over a source's input. The source is available for reading again once this is dropped.
pub struct InputGuard<'source> {
    source: &'source Source,
    reader: Box<dyn BufRead + Send>,
}

/// The writer for a source's output. Dropping it without calling `finish` still closes the output,
/// but any error from flushing is lost.
pub struct OutputGuard<'source> {
    source: &'source Source,
    writer: Option<Box<dyn Write + Send>>,
}

impl Source {
    pub fn new(name: impl Into<String>, backend: Box<dyn SourceBackend>) -> Source {
        Source {
            name: name.into(),
            backend,
            state: Mutex::new(SourceState::default()),
        }
    }

    /// A source that reads `input` and writes to `output`, or back over `input` if no output is
    /// given.
    pub fn from_file(input: &Path, output: Option<&Path>) -> Source {
        let backend = FileBackend {
            input: input.to_owned(),
            output: output.unwrap_or(input).to_owned(),
            pending: Mutex::new(None),
        };
        Source::new(input.display().to_string(), Box::new(backend))
    }

    /// A source backed by `text`. The returned handle gives access to the output once the source
    /// has been closed.
    pub fn in_memory(name: impl Into<String>, text: impl Into<String>) -> (Source, MemoryOutput) {
        let finished = Arc::new(Mutex::new(None));
        let backend = MemoryBackend {
            input: text.into(),
            staging: SharedBuffer::default(),
            finished: finished.clone(),
        };
        (
            Source::new(name, Box::new(backend)),
            MemoryOutput { finished },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_input(&self) -> Result<InputGuard<'_>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(self.stream_error("is closed"));
            }
            if state.input_held {
                return Err(self.stream_error("already has an active input"));
            }
            state.input_held = true;
        }
        match self.backend.open_input() {
            Ok(reader) => Ok(InputGuard {
                source: self,
                reader,
            }),
            Err(error) => {
                self.state.lock().unwrap().input_held = false;
                Err(error.context(format!("Failed to open input of `{}`", self.name)))
            }
        }
    }

    pub fn start_output(&self) -> Result<OutputGuard<'_>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(self.stream_error("is closed"));
            }
            if state.output != OutputState::NotCreated {
                return Err(self.stream_error("already had its output created"));
            }
            state.output = OutputState::Open;
        }
        match self.backend.create_output() {
            Ok(writer) => Ok(OutputGuard {
                source: self,
                writer: Some(writer),
            }),
            Err(error) => {
                // The attempt counts as the one permitted creation.
                self.state.lock().unwrap().output = OutputState::Closed;
                Err(error.context(format!("Failed to create output of `{}`", self.name)))
            }
        }
    }

    /// Closes the source, finalizing its output. Closing an already closed source does nothing.
    pub fn close(&self) -> Result {
        let produced_output = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            if state.output == OutputState::Open {
                return Err(self.stream_error("output still active"));
            }
            if state.input_held {
                return Err(self.stream_error("input still active"));
            }
            state.closed = true;
            state.output == OutputState::Closed
        };
        tracing::debug!(source = %self.name, produced_output, "Closing source");
        let result = self
            .backend
            .finalize(produced_output)
            .with_context(|| format!("Failed to finalize output of `{}`", self.name));
        self.backend.cleanup();
        result
    }

    /// Closes the source without finalizing. Used when linking of the source failed, so that any
    /// partial output is discarded rather than promoted.
    pub(crate) fn abandon(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        tracing::debug!(source = %self.name, "Abandoning source");
        self.backend.cleanup();
    }

    fn stream_error(&self, problem: &str) -> crate::error::Error {
        LinkError::StreamState(format!("source `{}`: {problem}", self.name)).into()
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").field("name", &self.name).finish()
    }
}

impl std::fmt::Debug for InputGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputGuard")
            .field("source", &self.source.name)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for OutputGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputGuard")
            .field("source", &self.source.name)
            .field("open", &self.writer.is_some())
            .finish_non_exhaustive()
    }
}

impl Read for InputGuard<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for InputGuard<'_> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt);
    }
}

impl Drop for InputGuard<'_> {
    fn drop(&mut self) {
        self.source.state.lock().unwrap().input_held = false;
    }
}

impl OutputGuard<'_> {
    /// Flushes and closes the output.
    pub fn finish(mut self) -> Result {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_context(|| format!("Failed to write output of `{}`", self.source.name))?;
        }
        Ok(())
    }
}

impl Write for OutputGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for OutputGuard<'_> {
    fn drop(&mut self) {
        // Drop the writer first so that file handles are released before anyone can finalize.
        self.writer = None;
        self.source.state.lock().unwrap().output = OutputState::Closed;
    }
}

/// Writes output to a temporary file in the destination's directory, then renames it over the
/// destination on finalize.
struct FileBackend {
    input: PathBuf,
    output: PathBuf,
    pending: Mutex<Option<NamedTempFile>>,
}

impl SourceBackend for FileBackend {
    fn open_input(&self) -> Result<Box<dyn BufRead + Send>> {
        let file = std::fs::File::open(&self.input)
            .with_context(|| format!("Failed to open `{}`", self.input.display()))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn create_output(&self) -> Result<Box<dyn Write + Send>> {
        let directory = match self.output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(directory).with_context(|| {
            format!(
                "Failed to create temporary file in `{}`",
                directory.display()
            )
        })?;
        let file = temp.reopen()?;
        *self.pending.lock().unwrap() = Some(temp);
        Ok(Box::new(BufWriter::new(file)))
    }

    fn finalize(&self, produced_output: bool) -> Result {
        if !produced_output {
            return Ok(());
        }
        let Some(temp) = self.pending.lock().unwrap().take() else {
            return Ok(());
        };
        temp.persist(&self.output)
            .map_err(|error| error.error)
            .with_context(|| format!("Failed to write `{}`", self.output.display()))?;
        Ok(())
    }

    fn cleanup(&self) {
        // Dropping a temporary file that wasn't persisted deletes it.
        self.pending.lock().unwrap().take();
    }
}

#[derive(Default, Clone)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct MemoryBackend {
    input: String,
    staging: SharedBuffer,
    finished: Arc<Mutex<Option<String>>>,
}

/// Gives access to the output of an in-memory source.
#[derive(Clone)]
pub struct MemoryOutput {
    finished: Arc<Mutex<Option<String>>>,
}

impl MemoryOutput {
    /// The output text, if the source has been closed and produced output.
    pub fn text(&self) -> Option<String> {
        self.finished.lock().unwrap().clone()
    }
}

impl SourceBackend for MemoryBackend {
    fn open_input(&self) -> Result<Box<dyn BufRead + Send>> {
        Ok(Box::new(std::io::Cursor::new(self.input.clone().into_bytes())))
    }

    fn create_output(&self) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.staging.clone()))
    }

    fn finalize(&self, produced_output: bool) -> Result {
        if produced_output {
            let bytes = std::mem::take(&mut *self.staging.0.lock().unwrap());
            let text = String::from_utf8(bytes).context("Output isn't valid UTF-8")?;
            *self.finished.lock().unwrap() = Some(text);
        }
        Ok(())
    }

    fn cleanup(&self) {
        self.staging.0.lock().unwrap().clear();
    }
}
