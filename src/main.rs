// Copyright (C) 2026 The xsend Authors
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// XMODEM sender
mod digest;
mod framer;
mod logging;
mod protocol;
mod sender;
mod serial;

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use sender::{Response, SenderConfig, SenderFsm, TransferEvent, TransferObserver, TransferReport};
use serial::RealSerialPort;

#[derive(Parser)]
#[command(name = "xsend")]
#[command(about = "XMODEM (checksum) file sender for RS-232 links", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1); first available port if omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Milliseconds to wait for ACK/NAK after each block
    #[arg(long, default_value = "2700", value_name = "MS")]
    timeout_ms: u64,

    /// Milliseconds to wait for the receiver's closing response
    #[arg(long, default_value = "3000", value_name = "MS")]
    final_wait_ms: u64,

    /// Consecutive failed attempts tolerated on a single block
    #[arg(long, default_value = "10")]
    retries: u32,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file using XMODEM
    Send {
        /// File to send
        file: PathBuf,
    },
    /// List available serial ports
    Ports,
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

/// Prints per-block progress lines on the console
struct ConsoleProgress {
    verbose: bool,
}

fn describe(response: Response) -> String {
    match response {
        Response::Ack => "ACK".to_string(),
        Response::Nak => "NAK".to_string(),
        Response::Timeout => "timeout".to_string(),
        Response::Other(b) => format!("noise 0x{:02X}", b),
    }
}

impl TransferObserver for ConsoleProgress {
    fn on_event(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::FrameSent { block, number, attempt } if self.verbose => {
                println!("Sent block {} as #{} (attempt {})", block, number, attempt);
            }
            TransferEvent::Acknowledged { acked, total } => {
                println!("{:03}/{:03} blocks transmitted", acked, total);
            }
            TransferEvent::Retrying { block, total, retries, response, delay } => {
                print!(
                    "{:03}/{:03} blocks repeating {} ({}, retry in {} ms)\r",
                    block,
                    total,
                    ".".repeat(*retries as usize),
                    describe(*response),
                    delay.as_millis()
                );
                let _ = std::io::stdout().flush();
            }
            _ => {}
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let file = match cli.command {
        Commands::Send { file } => file,
        Commands::Ports => {
            match serial::list_ports() {
                Ok(ports) if ports.is_empty() => println!("No serial ports found"),
                Ok(ports) => ports.iter().for_each(|p| println!("{}", p)),
                Err(e) => fail(e),
            }
            return;
        }
    };

    let data_bits = parse_data_bits(cli.data_bits).unwrap_or_else(|e| fail(e));
    let parity = parse_parity(&cli.parity).unwrap_or_else(|e| fail(e));
    let stop_bits = parse_stop_bits(cli.stop_bits).unwrap_or_else(|e| fail(e));

    let data = std::fs::read(&file)
        .unwrap_or_else(|e| fail(format!("Cannot read {}: {}", file.display(), e)));
    let sha = digest::sha256_hex(&data);
    tracing::info!(file = %file.display(), bytes = data.len(), sha256 = %sha, "Loaded file");
    println!("File: {} ({} bytes), sha256 digest: {}", file.display(), data.len(), digest::short_id(&sha));

    let port_name = match cli.port {
        Some(name) => name,
        None => {
            let name = serial::discover_port().unwrap_or_else(|e| fail(e));
            println!("Serial port found: {}", name);
            name
        }
    };

    println!("Opening serial port: {}", port_name);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = RealSerialPort::open(&port_name, cli.baud, data_bits, parity, stop_bits)
        .unwrap_or_else(|e| fail(e));

    let config = SenderConfig {
        retry_limit: cli.retries,
        response_timeout: Duration::from_millis(cli.timeout_ms),
        final_wait: Duration::from_millis(cli.final_wait_ms),
        ..SenderConfig::default()
    };

    println!("\nSending file: {}", file.display());
    let progress = ConsoleProgress { verbose: cli.debug };
    let report = match send_file(serial_port, &data, config, progress) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Send failed: {}", e);
            std::process::exit(1);
        }
    };

    println!(
        "{:03}/{:03} blocks transmitted in {} seconds",
        report.acked_blocks,
        report.total_blocks,
        report.elapsed.as_secs()
    );
    println!("Response: <{}>", String::from_utf8_lossy(&report.trailing));
    tracing::info!(
        frames = report.frames_sent,
        negative = report.negative_signals,
        outcome = ?report.outcome,
        "Session finished"
    );

    if !report.is_complete() {
        eprintln!("\nTransfer incomplete: receiver stopped acknowledging");
        std::process::exit(2);
    }
    println!("\nFile sent successfully!");
}

fn send_file(
    serial_port: RealSerialPort,
    data: &[u8],
    config: SenderConfig,
    progress: ConsoleProgress,
) -> Result<TransferReport, sender::SenderError> {
    let blocks = framer::chunk(data);
    let fsm = SenderFsm::new(Box::new(serial_port), blocks, config).with_observer(progress);
    sender::run(fsm.start())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_response() {
        assert_eq!(describe(Response::Nak), "NAK");
        assert_eq!(describe(Response::Timeout), "timeout");
        assert_eq!(describe(Response::Other(0x86)), "noise 0x86");
    }

    #[test]
    fn test_cli_millisecond_flags() {
        let cli = Cli::try_parse_from([
            "xsend", "--port", "/dev/ttyUSB0", "--timeout-ms", "500", "--final-wait-ms", "1000", "send", "a.bin",
        ])
        .unwrap();
        assert_eq!(cli.timeout_ms, 500);
        assert_eq!(cli.final_wait_ms, 1000);
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
    }
}
