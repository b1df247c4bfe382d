use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::core::error::FaultKind;
use crate::core::output::TextOutput;
use crate::core::protocol::{decode, NoiseKind, ProtocolEvent, EMPTY_DATA_SENTINEL};
use crate::core::store::{CardRecord, CardStore};
use crate::core::transport::LineTransport;

/// Default upper bound of one read, and so of cancellation latency
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared flag used to stop a running monitor from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where the output text of a card read came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSource {
    Association,
    CardData,
}

/// Text to emit for a card read, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub text: String,
    pub source: OutputSource,
}

/// Pick the output text for a card: association first, then non-empty card data
pub fn resolve_output(association: Option<&str>, data: &str) -> Option<ResolvedOutput> {
    if let Some(text) = association {
        return Some(ResolvedOutput {
            text: text.to_string(),
            source: OutputSource::Association,
        });
    }
    if !data.is_empty() && data != EMPTY_DATA_SENTINEL {
        return Some(ResolvedOutput {
            text: data.to_string(),
            source: OutputSource::CardData,
        });
    }
    None
}

/// What the monitor did with one line or poll
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A card was read and recorded
    CardRead {
        record: CardRecord,
        output: Option<ResolvedOutput>,
        /// Whether the output sink received the text
        emitted: bool,
    },
    /// A decoded card read that could not be persisted
    StoreFailed { uuid: String, message: String },
    /// Any non-card line, shown for visibility only
    Diagnostic { line: String, event: ProtocolEvent },
    /// A read from the device failed; the loop keeps going
    TransportFault { kind: FaultKind, message: String },
}

/// Counters collected over one monitor run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub lines: usize,
    pub cards: usize,
    pub outputs: usize,
    pub anomalies: usize,
    pub transport_faults: usize,
}

/// Reads card frames until cancelled, keeping the store up to date
pub struct MonitorLoop<'a, T: LineTransport> {
    transport: &'a mut T,
    store: &'a mut CardStore,
    output: Option<Box<dyn TextOutput + 'a>>,
    poll_interval: Duration,
    stats: MonitorStats,
}

impl<'a, T: LineTransport> MonitorLoop<'a, T> {
    pub fn new(transport: &'a mut T, store: &'a mut CardStore) -> Self {
        Self {
            transport,
            store,
            output: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stats: MonitorStats::default(),
        }
    }

    /// Send resolved text to `output` on every card read
    pub fn with_output(mut self, output: Box<dyn TextOutput + 'a>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Poll until `cancel` is set, reporting everything to `on_event`
    pub fn run<F>(&mut self, cancel: &CancelToken, mut on_event: F) -> MonitorStats
    where
        F: FnMut(&MonitorEvent),
    {
        log::info!(
            "Monitoring for cards (output {})",
            if self.output.is_some() { "enabled" } else { "disabled" }
        );

        while !cancel.is_cancelled() {
            if let Some(event) = self.poll_once() {
                on_event(&event);
            }
        }

        log::info!("Monitor stopped after {} card reads", self.stats.cards);
        self.stats.clone()
    }

    /// One iteration: read at most one line and handle it
    pub fn poll_once(&mut self) -> Option<MonitorEvent> {
        match self.transport.read_line(self.poll_interval) {
            Ok(Some(line)) => Some(self.handle_line(&line)),
            Ok(None) => None,
            Err(e) => {
                log::error!("Read from device failed: {}", e);
                self.stats.transport_faults += 1;
                // Do not spin on a dead port
                thread::sleep(self.poll_interval);
                Some(MonitorEvent::TransportFault {
                    kind: e.kind(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Decode one line and act on it
    pub fn handle_line(&mut self, line: &str) -> MonitorEvent {
        self.stats.lines += 1;

        match decode(line) {
            ProtocolEvent::CardRead { uuid, data } => self.handle_card(&uuid, &data),
            event => {
                match &event {
                    ProtocolEvent::Noise {
                        kind: NoiseKind::MalformedFrame { segments },
                        ..
                    } => {
                        self.stats.anomalies += 1;
                        log::warn!("Invalid card format ({} segments): {}", segments, line);
                    }
                    ProtocolEvent::DeviceReset => log::warn!("Device reset detected: {}", line),
                    _ => log::info!("Device: {}", line),
                }
                MonitorEvent::Diagnostic {
                    line: line.to_string(),
                    event,
                }
            }
        }
    }

    fn handle_card(&mut self, uuid: &str, data: &str) -> MonitorEvent {
        let record = match self.store.record_read(uuid, data, Utc::now()) {
            Ok(record) => record,
            Err(e) => {
                log::error!("Failed to save card {}: {}", uuid, e);
                return MonitorEvent::StoreFailed {
                    uuid: uuid.to_string(),
                    message: e.to_string(),
                };
            }
        };
        self.stats.cards += 1;
        log::info!("Card read: {} (count {})", uuid, record.read_count);

        let output = resolve_output(self.store.association(uuid), data);
        let mut emitted = false;
        if let (Some(sink), Some(resolved)) = (self.output.as_mut(), output.as_ref()) {
            match sink.type_text(&resolved.text) {
                Ok(()) => {
                    emitted = true;
                    self.stats.outputs += 1;
                }
                Err(e) => log::error!("Error typing text: {}", e),
            }
        }

        MonitorEvent::CardRead {
            record,
            output,
            emitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TransportError;
    use crate::core::output::MockTextOutput;
    use mockall::predicate::eq;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    struct CannedTransport {
        lines: VecDeque<String>,
    }

    impl LineTransport for CannedTransport {
        fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, TransportError> {
            Ok(self.lines.pop_front())
        }

        fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn reset_input(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn transport(lines: &[&str]) -> CannedTransport {
        CannedTransport {
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn test_resolve_output_precedence() {
        assert_eq!(
            resolve_output(Some("door"), "1234"),
            Some(ResolvedOutput {
                text: "door".to_string(),
                source: OutputSource::Association
            })
        );
        assert_eq!(
            resolve_output(None, "1234"),
            Some(ResolvedOutput {
                text: "1234".to_string(),
                source: OutputSource::CardData
            })
        );
        assert_eq!(resolve_output(None, "EMPTY"), None);
        assert_eq!(resolve_output(None, ""), None);
        assert_eq!(
            resolve_output(Some("door"), "EMPTY").map(|o| o.text),
            Some("door".to_string())
        );
    }

    #[test]
    fn test_card_read_uses_association() {
        let dir = TempDir::new().unwrap();
        let mut store = CardStore::open(dir.path()).unwrap();
        store.associate("04A1", "door").unwrap();

        let mut output = MockTextOutput::new();
        output
            .expect_type_text()
            .with(eq("door"))
            .times(1)
            .returning(|_| Ok(()));

        let mut transport = transport(&["START_CARD-04A1_CARRIED-1234"]);
        let mut monitor =
            MonitorLoop::new(&mut transport, &mut store).with_output(Box::new(output));

        match monitor.poll_once() {
            Some(MonitorEvent::CardRead { record, output, emitted }) => {
                assert_eq!(record.read_count, 1);
                assert_eq!(record.data, "1234");
                assert_eq!(output.unwrap().source, OutputSource::Association);
                assert!(emitted);
            }
            other => panic!("Expected card read, got {other:?}"),
        }
        assert_eq!(monitor.stats().outputs, 1);
    }

    #[test]
    fn test_empty_card_is_not_typed() {
        let dir = TempDir::new().unwrap();
        let mut store = CardStore::open(dir.path()).unwrap();

        let mut output = MockTextOutput::new();
        output.expect_type_text().never();

        let mut transport = transport(&[]);
        let mut monitor =
            MonitorLoop::new(&mut transport, &mut store).with_output(Box::new(output));
        let event = monitor.handle_line("START_CARD-04A1_CARRIED-EMPTY");

        assert!(matches!(
            event,
            MonitorEvent::CardRead { output: None, emitted: false, .. }
        ));
        drop(monitor);
        assert_eq!(store.card("04A1").unwrap().data, "EMPTY");
    }

    #[test]
    fn test_sink_error_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut store = CardStore::open(dir.path()).unwrap();

        let mut output = MockTextOutput::new();
        output
            .expect_type_text()
            .times(2)
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::Other, "no display")));

        let mut transport = transport(&[]);
        let mut monitor =
            MonitorLoop::new(&mut transport, &mut store).with_output(Box::new(output));
        monitor.handle_line("START_CARD-04A1_CARRIED-1234");
        let event = monitor.handle_line("START_CARD-04A1_CARRIED-1234");

        assert!(matches!(event, MonitorEvent::CardRead { emitted: false, .. }));
        assert_eq!(monitor.stats().cards, 2);
        assert_eq!(monitor.stats().outputs, 0);
    }

    #[test]
    fn test_malformed_frame_is_counted_not_stored() {
        let dir = TempDir::new().unwrap();
        let mut store = CardStore::open(dir.path()).unwrap();

        let mut transport = transport(&[]);
        let mut monitor = MonitorLoop::new(&mut transport, &mut store);
        let event = monitor.handle_line("START_CARD-04A1_CARRIED-a_CARRIED-b");

        assert!(matches!(
            event,
            MonitorEvent::Diagnostic {
                event: ProtocolEvent::Noise { kind: NoiseKind::MalformedFrame { segments: 3 }, .. },
                ..
            }
        ));
        assert_eq!(monitor.stats().anomalies, 1);
        drop(monitor);
        assert_eq!(store.cards().count(), 0);
    }

    #[test]
    fn test_reset_outside_write_is_diagnostic() {
        let dir = TempDir::new().unwrap();
        let mut store = CardStore::open(dir.path()).unwrap();
        let mut transport = transport(&["rst:0x1 (POWERON_RESET),boot:0x13"]);
        let mut monitor = MonitorLoop::new(&mut transport, &mut store);

        assert!(matches!(
            monitor.poll_once(),
            Some(MonitorEvent::Diagnostic { event: ProtocolEvent::DeviceReset, .. })
        ));
        // Silent device: nothing to report
        assert!(monitor.poll_once().is_none());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_run_returns_immediately_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let mut store = CardStore::open(dir.path()).unwrap();
        let mut transport = transport(&["START_CARD-04A1_CARRIED-1234"]);
        let token = CancelToken::new();
        token.cancel();

        let stats = MonitorLoop::new(&mut transport, &mut store).run(&token, |_| {});
        assert_eq!(stats, MonitorStats::default());
    }
}
