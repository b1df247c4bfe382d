use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::core::{
    monitor::{CancelToken, MonitorEvent, MonitorLoop, OutputSource},
    output::StreamOutput,
    protocol::{NoiseKind, ProtocolEvent},
    store::{CardStore, DEFAULT_STORE_DIR},
    transport::{available_ports, SerialTransport, DEFAULT_BAUD_RATE},
    write::{WriteFailure, WriteOutcome, WriteSession, WriteTimings, MAX_PAYLOAD_LEN},
};

#[derive(Parser)]
#[command(name = "rfid-vault")]
#[command(about = "RFID reader/writer tool: monitor reads, write cards, manage associations")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Serial port of the reader (e.g. COM3 or /dev/ttyUSB0)
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Baud rate
    #[arg(short, long, global = true, default_value_t = DEFAULT_BAUD_RATE)]
    pub baudrate: u32,

    /// Directory holding the card and association files
    #[arg(short, long, global = true, default_value = DEFAULT_STORE_DIR)]
    pub config_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Monitor for card reads
    Monitor {
        /// Output card data or associated text on every read
        #[arg(short, long)]
        keyboard: bool,
    },

    /// Write data to the next card presented
    Write {
        /// Data to write (max 16 characters)
        data: String,

        /// Seconds to wait for a card
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },

    /// List all saved cards
    ListCards,

    /// List all UUID associations
    ListAssociations,

    /// Associate a card UUID with text
    Associate {
        /// Card UUID
        uuid: String,

        /// Text to associate
        text: String,
    },

    /// Delete a saved card
    DeleteCard {
        /// Card UUID to delete
        uuid: String,
    },

    /// Delete a UUID association
    DeleteAssociation {
        /// UUID whose association to delete
        uuid: String,
    },

    /// List serial ports
    Ports,
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match &cli.command {
        Commands::Monitor { keyboard } => cmd_monitor(&cli, *keyboard),
        Commands::Write { data, timeout } => cmd_write(&cli, data, *timeout),
        Commands::ListCards => cmd_list_cards(&cli.config_dir),
        Commands::ListAssociations => cmd_list_associations(&cli.config_dir),
        Commands::Associate { uuid, text } => cmd_associate(&cli.config_dir, uuid, text),
        Commands::DeleteCard { uuid } => cmd_delete_card(&cli.config_dir, uuid),
        Commands::DeleteAssociation { uuid } => cmd_delete_association(&cli.config_dir, uuid),
        Commands::Ports => cmd_ports(),
    }
}

fn open_store(dir: &Path) -> Result<CardStore> {
    CardStore::open(dir).with_context(|| format!("Failed to open card store in {}", dir.display()))
}

fn connect(cli: &Cli) -> Result<SerialTransport> {
    let Some(port) = cli.port.as_deref() else {
        bail!("This command needs a serial port (--port)");
    };

    let transport = SerialTransport::open(port, cli.baudrate).map_err(|e| {
        let kind = e.kind();
        anyhow::Error::new(e).context(format!("{kind}: could not open {port}"))
    })?;
    println!("Connected to {port}");
    Ok(transport)
}

fn cmd_monitor(cli: &Cli, keyboard: bool) -> Result<()> {
    let mut store = open_store(&cli.config_dir)?;
    let mut transport = connect(cli)?;

    let cancel = CancelToken::new();
    spawn_quit_listener(cancel.clone());

    println!("Monitoring for cards... (type 'q' + Enter or press Ctrl+C to stop)");
    println!(
        "Keyboard output: {}",
        if keyboard { "Enabled" } else { "Disabled" }
    );

    let mut monitor = MonitorLoop::new(&mut transport, &mut store);
    if keyboard {
        monitor = monitor.with_output(Box::new(StreamOutput::stdout()));
    }

    let stats = monitor.run(&cancel, print_monitor_event);

    println!();
    println!("Stopping monitor...");
    println!("Cards read: {}", stats.cards);
    if stats.anomalies > 0 {
        println!("Malformed card frames: {}", stats.anomalies);
    }
    if stats.transport_faults > 0 {
        println!("Read errors: {}", stats.transport_faults);
    }

    Ok(())
}

/// Cancel the monitor when the operator enters `q` on stdin
fn spawn_quit_listener(cancel: CancelToken) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(input) if matches!(input.trim(), "q" | "quit" | "exit") => {
                    cancel.cancel();
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}

fn print_monitor_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::CardRead { record, output, .. } => {
            println!();
            println!("--- Card Read ---");
            println!("UUID: {}", record.uuid);
            println!("Data: {}", record.data);
            println!("Read count: {}", record.read_count);
            match output {
                Some(resolved) if resolved.source == OutputSource::Association => {
                    println!("Associated text: {}", resolved.text)
                }
                Some(_) => println!("Using card data for output"),
                None => {}
            }
            println!("--- End ---");
            println!();
        }
        MonitorEvent::StoreFailed { uuid, message } => {
            println!("Error saving card {uuid}: {message}");
        }
        MonitorEvent::Diagnostic { line, event } => match event {
            ProtocolEvent::Noise {
                kind: NoiseKind::MalformedFrame { .. },
                ..
            } => println!("Invalid card format: {line}"),
            ProtocolEvent::DeviceReset => {
                println!("Device: {line}");
                println!("Device reset detected, continuing to monitor");
            }
            _ => println!("Device: {line}"),
        },
        MonitorEvent::TransportFault { kind, message } => {
            println!("Read error ({kind}): {message}");
        }
    }
}

fn cmd_write(cli: &Cli, data: &str, timeout_secs: u64) -> Result<()> {
    let mut transport = connect(cli)?;

    let timings = WriteTimings {
        card_timeout: Duration::from_secs(timeout_secs),
        ..WriteTimings::default()
    };
    let mut session = WriteSession::with_timings(&mut transport, timings);

    println!("Present card to write data...");
    let report = session.run_write_with(data, |line, event| {
        println!("Device: {line}");
        if let ProtocolEvent::DeviceReset = event {
            println!(
                "Device reset detected! This may indicate power issues or communication problems."
            );
        }
    });

    if report.line_breaks_removed {
        println!("Warning: Line breaks removed from data");
    }
    if report.truncated {
        println!("Warning: Data truncated to {MAX_PAYLOAD_LEN} characters");
    }
    println!("Data sent: {}", report.payload);
    println!("Duration: {}ms", report.duration_ms);

    match &report.outcome {
        WriteOutcome::Success => {
            println!("Write successful!");
            Ok(())
        }
        WriteOutcome::Failure(failure) => {
            let kind = failure.kind();
            match failure {
                WriteFailure::Rejected { reason } => bail!("Write failed ({kind}): {reason}"),
                WriteFailure::DeviceReset => bail!("Write failed ({kind}): {failure}"),
                WriteFailure::Transport { message } => bail!("Write failed ({kind}): {message}"),
            }
        }
        WriteOutcome::Timeout => bail!(
            "Write failed (operation timeout): no card written within {timeout_secs}s"
        ),
    }
}

fn cmd_list_cards(dir: &Path) -> Result<()> {
    let store = open_store(dir)?;

    if store.cards().next().is_none() {
        println!("No cards saved");
        return Ok(());
    }

    println!("--- Saved Cards ---");
    for card in store.cards() {
        println!("UUID: {}", card.uuid);
        println!("  Data: {}", card.data);
        println!("  Last seen: {}", card.last_seen.to_rfc3339());
        println!("  Read count: {}", card.read_count);
        if let Some(text) = store.association(&card.uuid) {
            println!("  Associated text: {text}");
        }
        println!();
    }

    Ok(())
}

fn cmd_list_associations(dir: &Path) -> Result<()> {
    let store = open_store(dir)?;

    if store.associations().next().is_none() {
        println!("No associations saved");
        return Ok(());
    }

    println!("--- UUID Associations ---");
    for (uuid, text) in store.associations() {
        println!("{uuid} -> {text}");
    }

    Ok(())
}

fn cmd_associate(dir: &Path, uuid: &str, text: &str) -> Result<()> {
    let mut store = open_store(dir)?;
    store
        .associate(uuid, text)
        .context("Failed to save association")?;
    println!("Associated UUID {uuid} with text: {text}");
    Ok(())
}

fn cmd_delete_card(dir: &Path, uuid: &str) -> Result<()> {
    let mut store = open_store(dir)?;
    if store.delete_card(uuid).context("Failed to save cards")? {
        println!("Deleted card: {uuid}");
    } else {
        println!("Card not found: {uuid}");
    }
    Ok(())
}

fn cmd_delete_association(dir: &Path, uuid: &str) -> Result<()> {
    let mut store = open_store(dir)?;
    if store
        .delete_association(uuid)
        .context("Failed to save associations")?
    {
        println!("Deleted association: {uuid}");
    } else {
        println!("Association not found: {uuid}");
    }
    Ok(())
}

fn cmd_ports() -> Result<()> {
    let ports = available_ports().context("Failed to list serial ports")?;

    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    println!("Available serial ports:");
    for port in ports {
        match (port.vid_pid, port.product) {
            (Some((vid, pid)), Some(product)) => println!(
                "  {} [{}] {:04X}:{:04X} {}",
                port.name, port.port_type, vid, pid, product
            ),
            (Some((vid, pid)), None) => {
                println!("  {} [{}] {:04X}:{:04X}", port.name, port.port_type, vid, pid)
            }
            _ => println!("  {} [{}]", port.name, port.port_type),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["rfid-vault", "monitor", "--keyboard", "-p", "/dev/ttyUSB0"])
                .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baudrate, 115_200);
        assert_eq!(cli.config_dir, PathBuf::from("config"));
        assert!(matches!(cli.command, Commands::Monitor { keyboard: true }));
    }

    #[test]
    fn test_parse_write() {
        let cli = Cli::try_parse_from([
            "rfid-vault",
            "--port",
            "COM3",
            "--baudrate",
            "9600",
            "write",
            "hello",
        ])
        .unwrap();
        assert_eq!(cli.baudrate, 9600);
        match cli.command {
            Commands::Write { data, timeout } => {
                assert_eq!(data, "hello");
                assert_eq!(timeout, 30);
            }
            _ => panic!("Expected write command"),
        }
    }

    #[test]
    fn test_parse_kebab_case_commands() {
        assert!(matches!(
            Cli::try_parse_from(["rfid-vault", "delete-association", "04A1"]).unwrap().command,
            Commands::DeleteAssociation { .. }
        ));
        assert!(matches!(
            Cli::try_parse_from(["rfid-vault", "list-cards"]).unwrap().command,
            Commands::ListCards
        ));
    }
}
