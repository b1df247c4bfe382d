/// RFID Vault - host-side tool for a serial RFID reader/writer
///
/// This library provides the line protocol, the write handshake, the card
/// monitor and the JSON card store used by the `rfid-vault` CLI.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use crate::core::{
    error::{FaultKind, StoreError, TransportError},
    monitor::{CancelToken, MonitorEvent, MonitorLoop, MonitorStats},
    protocol::{decode, ProtocolEvent},
    store::{CardRecord, CardStore},
    transport::{LineTransport, SerialTransport},
    write::{WriteOutcome, WriteReport, WriteSession, WriteTimings},
};

// Common error type
pub type Result<T> = anyhow::Result<T>;
