use anyhow::Result;

/// Receives the progress of one pass. Methods take `&self` so the same
/// updater can be shared by the line adapter and the feature stage.
pub trait ProgressUpdater {
    /// `bytes` is the running total consumed so far in this pass.
    fn on_bytes_processed(&self, bytes: u64);
    fn on_counters(&self, count: u64, passed: u64, output_size: u64);
}

pub struct NoopProgress;

impl ProgressUpdater for NoopProgress {
    fn on_bytes_processed(&self, _bytes: u64) {}
    fn on_counters(&self, _count: u64, _passed: u64, _output_size: u64) {}
}

/// Push-style interface the archive collaborator writes decompressed bytes into.
pub trait ChunkSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Downstream consumer of complete lines (newline already stripped).
pub trait LineHandler {
    fn handle_line(&mut self, line: &[u8]) -> Result<()>;
}

impl<F> LineHandler for F
where
    F: FnMut(&[u8]) -> Result<()>,
{
    fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        self(line)
    }
}

/// Turns arbitrarily sized byte pushes into a sequence of lines.
///
/// Bytes after the last newline stay buffered until the next push, or until
/// [`LineReassembler::flush_tail`] forwards them as the final line.
pub struct LineReassembler<'p, H> {
    handler: H,
    progress: &'p dyn ProgressUpdater,
    buffer: Vec<u8>,
    consumed: u64,
    closed: bool,
}

impl<'p, H: LineHandler> LineReassembler<'p, H> {
    pub fn new(handler: H, progress: &'p dyn ProgressUpdater) -> Self {
        Self {
            handler,
            progress,
            buffer: Vec::new(),
            consumed: 0,
            closed: false,
        }
    }

    pub fn on_bytes(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        self.consumed += chunk.len() as u64;

        let mut start = 0;
        let mut failure = None;
        // Lines are sliced out in place and the consumed prefix drained once per push
        for newline in memchr::memchr_iter(b'\n', &self.buffer) {
            let line = &self.buffer[start..newline];
            start = newline + 1;
            if let Err(err) = self.handler.handle_line(line) {
                failure = Some(err);
                break;
            }
        }
        self.buffer.drain(..start);
        if let Some(err) = failure {
            return Err(err);
        }

        self.progress.on_bytes_processed(self.consumed);
        Ok(())
    }

    /// Forwards the unterminated remainder, if any. Later calls are no-ops.
    pub fn flush_tail(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.buffer.is_empty() {
            return Ok(());
        }
        let tail = std::mem::take(&mut self.buffer);
        self.handler.handle_line(&tail)
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    pub fn into_handler(self) -> H {
        self.handler
    }
}

impl<H: LineHandler> ChunkSink for LineReassembler<'_, H> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.on_bytes(chunk)
    }

    fn close(&mut self) -> Result<()> {
        self.flush_tail()
    }
}
