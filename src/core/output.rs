use std::io::{self, Write};
use std::thread;
use std::time::Duration;

/// Pause before emitting text, so the operator can focus the target field
pub const DEFAULT_TYPING_DELAY: Duration = Duration::from_millis(500);

/// Destination for the text resolved from a card read
#[cfg_attr(test, mockall::automock)]
pub trait TextOutput {
    fn type_text(&mut self, text: &str) -> io::Result<()>;
}

/// Emits resolved text as a line on a writer (stdout for `monitor --keyboard`)
pub struct StreamOutput<W: Write> {
    writer: W,
    delay: Duration,
}

impl StreamOutput<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout(), DEFAULT_TYPING_DELAY)
    }
}

impl<W: Write> StreamOutput<W> {
    pub fn new(writer: W, delay: Duration) -> Self {
        Self { writer, delay }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TextOutput for StreamOutput<W> {
    fn type_text(&mut self, text: &str) -> io::Result<()> {
        log::info!("Typing: {}", text);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        writeln!(self.writer, "{text}")?;
        self.writer.flush()
    }
}
