use std::thread;
use std::time::{Duration, Instant};

use crate::core::error::{FaultKind, TransportError};
use crate::core::protocol::{decode, ProtocolEvent, ENTER_WRITE_MODE};
use crate::core::transport::LineTransport;
use crate::core::utils::{strip_line_breaks, truncate_payload};

/// Longest payload the reader accepts, in characters
pub const MAX_PAYLOAD_LEN: usize = 16;

/// Delays and budget of the write handshake
#[derive(Debug, Clone)]
pub struct WriteTimings {
    /// Pause after `START_WRITE` so the reader can switch modes
    pub mode_settle: Duration,
    /// Pause after sending the payload
    pub payload_settle: Duration,
    /// How long to wait for a card and its outcome
    pub card_timeout: Duration,
    /// Upper bound of a single read while waiting
    pub poll_interval: Duration,
}

impl Default for WriteTimings {
    fn default() -> Self {
        Self {
            mode_settle: Duration::from_secs(1),
            payload_settle: Duration::from_millis(500),
            card_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Where a write session is in the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    EnteringWriteMode,
    SendingPayload,
    AwaitingCard,
    Completed { success: bool },
    TimedOut,
}

/// Why a write did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFailure {
    /// The reader reported a failure; `reason` is the phrase it printed
    Rejected { reason: String },
    /// The reader rebooted while waiting for the card
    DeviceReset,
    /// Bytes could not be exchanged with the reader
    Transport { message: String },
}

impl WriteFailure {
    pub fn kind(&self) -> FaultKind {
        match self {
            WriteFailure::Rejected { .. } | WriteFailure::Transport { .. } => FaultKind::WriteFault,
            WriteFailure::DeviceReset => FaultKind::DeviceReset,
        }
    }
}

impl std::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteFailure::Rejected { reason } => write!(f, "{reason}"),
            WriteFailure::DeviceReset => {
                write!(f, "reader reset during write (power or communication problem?)")
            }
            WriteFailure::Transport { message } => write!(f, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    Failure(WriteFailure),
    Timeout,
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteOutcome::Success)
    }

    /// Fault kind for anything but success
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            WriteOutcome::Success => None,
            WriteOutcome::Failure(failure) => Some(failure.kind()),
            WriteOutcome::Timeout => Some(FaultKind::OperationTimeout),
        }
    }
}

/// Result of one write session
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub outcome: WriteOutcome,
    /// The payload actually sent to the reader
    pub payload: String,
    pub truncated: bool,
    /// Set when `\r`/`\n` had to be removed from the payload
    pub line_breaks_removed: bool,
    /// Every line received while waiting for the card
    pub transcript: Vec<String>,
    pub duration_ms: u64,
}

/// Drives the write handshake over a transport it borrows exclusively
pub struct WriteSession<'a, T: LineTransport> {
    transport: &'a mut T,
    timings: WriteTimings,
    state: WriteState,
}

impl<'a, T: LineTransport> WriteSession<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self::with_timings(transport, WriteTimings::default())
    }

    pub fn with_timings(transport: &'a mut T, timings: WriteTimings) -> Self {
        Self {
            transport,
            timings,
            state: WriteState::Idle,
        }
    }

    pub fn state(&self) -> &WriteState {
        &self.state
    }

    pub fn timings(&self) -> &WriteTimings {
        &self.timings
    }

    /// Write `data` to the next card presented to the reader
    pub fn run_write(&mut self, data: &str) -> WriteReport {
        self.run_write_with(data, |_, _| {})
    }

    /// Like [`run_write`](Self::run_write), calling `on_line` for every
    /// line received while waiting for the card
    pub fn run_write_with<F>(&mut self, data: &str, mut on_line: F) -> WriteReport
    where
        F: FnMut(&str, &ProtocolEvent),
    {
        let start_time = Instant::now();
        let (single_line, line_breaks_removed) = strip_line_breaks(data);
        if line_breaks_removed {
            log::warn!("Line breaks removed from data");
        }
        let (payload, truncated) = truncate_payload(&single_line, MAX_PAYLOAD_LEN);
        if truncated {
            log::warn!("Data truncated to {} characters", MAX_PAYLOAD_LEN);
        }

        let mut transcript = Vec::new();
        let outcome = match self.handshake(&payload) {
            Ok(()) => self.await_card(&mut transcript, &mut on_line),
            Err(e) => {
                log::error!("Write session aborted: {}", e);
                self.transition(WriteState::Completed { success: false });
                WriteOutcome::Failure(WriteFailure::Transport {
                    message: e.to_string(),
                })
            }
        };

        WriteReport {
            outcome,
            payload,
            truncated,
            line_breaks_removed,
            transcript,
            duration_ms: start_time.elapsed().as_millis() as u64,
        }
    }

    fn handshake(&mut self, payload: &str) -> Result<(), TransportError> {
        self.transition(WriteState::EnteringWriteMode);
        log::info!("Entering write mode");
        self.transport.send_line(ENTER_WRITE_MODE)?;
        sleep(self.timings.mode_settle);

        self.transition(WriteState::SendingPayload);
        log::info!("Sending data: {}", payload);
        self.transport.send_line(payload)?;
        sleep(self.timings.payload_settle);

        // Whatever arrived so far belongs to the mode switch, not to the card
        self.transport.reset_input()?;
        self.transition(WriteState::AwaitingCard);
        Ok(())
    }

    fn await_card<F>(&mut self, transcript: &mut Vec<String>, on_line: &mut F) -> WriteOutcome
    where
        F: FnMut(&str, &ProtocolEvent),
    {
        log::info!("Waiting for card");
        let deadline = Instant::now() + self.timings.card_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let line = match self
                .transport
                .read_line(remaining.min(self.timings.poll_interval))
            {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Lost device while waiting for card: {}", e);
                    self.transition(WriteState::Completed { success: false });
                    return WriteOutcome::Failure(WriteFailure::Transport {
                        message: e.to_string(),
                    });
                }
            };

            let event = decode(&line);
            log::info!("Device: {}", line);
            on_line(&line, &event);
            transcript.push(line);

            let outcome = match event {
                ProtocolEvent::WriteSucceeded => WriteOutcome::Success,
                // Reaching read mode means the write cycle ran to the end
                ProtocolEvent::ReadModeReturned => WriteOutcome::Success,
                ProtocolEvent::WriteFailed { reason } => {
                    WriteOutcome::Failure(WriteFailure::Rejected { reason })
                }
                ProtocolEvent::DeviceReset => WriteOutcome::Failure(WriteFailure::DeviceReset),
                ProtocolEvent::CardRead { .. } | ProtocolEvent::Noise { .. } => continue,
            };

            self.transition(WriteState::Completed {
                success: outcome.is_success(),
            });
            return outcome;
        }

        log::warn!(
            "Write timeout after {}ms",
            self.timings.card_timeout.as_millis()
        );
        self.transition(WriteState::TimedOut);
        WriteOutcome::Timeout
    }

    fn transition(&mut self, next: WriteState) {
        log::debug!("Write session: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

fn sleep(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}
