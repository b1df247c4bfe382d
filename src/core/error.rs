use std::fmt;
use std::path::PathBuf;

/// The kinds of fault an operation against the reader can end in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The serial port could not be opened
    ConnectError,
    /// Bytes could not be written to (or read from) the link
    WriteFault,
    /// A card frame arrived with the wrong number of segments
    DecodeAnomaly,
    /// No terminal protocol line arrived within the budget
    OperationTimeout,
    /// The peripheral reset itself mid-operation
    DeviceReset,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::ConnectError => "connect error",
            FaultKind::WriteFault => "write fault",
            FaultKind::DecodeAnomaly => "decode anomaly",
            FaultKind::OperationTimeout => "operation timeout",
            FaultKind::DeviceReset => "device reset",
        };
        f.write_str(name)
    }
}

/// Errors raised by a line transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {port}: {source}")]
    Connect {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Failed to write to device: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to read from device: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to configure serial port: {0}")]
    Configure(#[from] serialport::Error),
}

impl TransportError {
    pub fn kind(&self) -> FaultKind {
        match self {
            TransportError::Connect { .. } => FaultKind::ConnectError,
            // Any failure on an open link is reported as a link fault
            TransportError::Write(_) | TransportError::Read(_) | TransportError::Configure(_) => {
                FaultKind::WriteFault
            }
        }
    }
}

/// Errors raised while loading or saving the card store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize store: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_transport_error_kinds() {
        let write = TransportError::Write(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(write.kind(), FaultKind::WriteFault);

        let connect = TransportError::Connect {
            port: "/dev/ttyUSB9".to_string(),
            source: serialport::Error::new(serialport::ErrorKind::NoDevice, "no such device"),
        };
        assert_eq!(connect.kind(), FaultKind::ConnectError);
        assert!(connect.to_string().contains("/dev/ttyUSB9"));
    }

    #[test]
    fn test_fault_kind_display() {
        assert_eq!(FaultKind::OperationTimeout.to_string(), "operation timeout");
        assert_eq!(FaultKind::DeviceReset.to_string(), "device reset");
        assert_eq!(FaultKind::DecodeAnomaly.to_string(), "decode anomaly");
    }

    #[test]
    fn test_store_error_mentions_path() {
        let err = StoreError::Io {
            path: PathBuf::from("config/rfid_cards.json"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("rfid_cards.json"));
    }
}
