//! A serial terminal: sends stdin to a serial device and writes what it sends back to stdout.
//!
//! See `lib.rs` for documentation.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use std::process;

use serial_facade::{DataBits, DeviceConfig, FlowControl, Parity, Settings, StopBits};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The serial port to open, such as `/dev/ttyUSB0` or `COM3`
    #[arg(required_unless_present = "list_ports")]
    port: Option<String>,

    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    #[arg(long, value_enum, default_value_t)]
    data_bits: DataBits,

    #[arg(long, value_enum, default_value_t)]
    parity: Parity,

    #[arg(long, value_enum, default_value_t)]
    stop_bits: StopBits,

    #[arg(long, value_enum, default_value_t)]
    flow_control: FlowControl,

    /// Run the device on this thread instead of a dedicated worker thread
    #[arg(long)]
    single_threaded: bool,

    /// Echo input to stdout as it is sent
    #[arg(long)]
    local_echo: bool,

    /// List the available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Args {
    fn settings(self) -> Settings {
        Settings {
            device: DeviceConfig {
                path: self.port.unwrap_or_default(),
                baud_rate: self.baud,
                data_bits: self.data_bits,
                parity: self.parity,
                stop_bits: self.stop_bits,
                flow_control: self.flow_control,
            },
            multithreaded: !self.single_threaded,
            local_echo: self.local_echo,
        }
    }
}

fn list_ports() {
    match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => println!("No serial ports found"),
        Ok(ports) => {
            for p in ports {
                println!("{}", p.port_name);
            }
        }
        Err(e) => {
            eprintln!("Failed to list serial ports: {}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.list_ports {
        list_ports();
        return;
    }

    serial_facade::launch(args.settings()).await;
}
