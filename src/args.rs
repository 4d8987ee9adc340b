//! Argument parsing for running from the command line

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::command::DeliveryKind;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// IP address of the machine running the 7k center
    #[clap(short = 'a', long)]
    pub device_ip: Ipv4Addr,
    /// Port the 7k center listens on
    #[clap(long, default_value_t = 7000)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub device_port: u16,
    /// Multibeam model
    #[clap(short, long, default_value_t = 7125, value_parser = valid_sonar)]
    pub sonar: u32,
    /// IP address the device should send data to, defaults to the interface facing it
    #[clap(short, long)]
    pub own_ip: Option<Ipv4Addr>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
    #[clap(subcommand)]
    pub command: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Send one command from the command table, e.g. `send gain 30`
    Send {
        name: String,
        values: Vec<String>,
        /// Send as a UDP datagram instead of over the TCP connection
        #[clap(long)]
        udp: bool,
    },
    /// Print the current system settings (7503)
    Settings,
    /// Write the requested records to a file until interrupted
    Capture {
        #[clap(short, long, required = true, multiple_values = true)]
        records: Vec<u32>,
        #[clap(long)]
        output: PathBuf,
    },
    /// Step through every power and gain, recording each setting
    Calibrate {
        /// Defaults to a name built from the date and frequency
        #[clap(long)]
        output: Option<PathBuf>,
        /// Pings recorded per setting
        #[clap(long, default_value_t = 15)]
        pings: u32,
    },
    /// Summarize pings and sample the noise floor until interrupted
    Monitor {
        /// Seconds between water column samples
        #[clap(long, default_value_t = 5)]
        noise_period: u64,
    },
    /// Record raw element data (7038) at zero power over a range of gains
    Elements {
        /// Defaults to a name built from the date and frequency
        #[clap(long)]
        output: Option<PathBuf>,
        /// Pings recorded per gain
        #[clap(long, default_value_t = 15)]
        pings: u32,
    },
    /// Put the sonar back in beamformed mode
    Beamform,
    /// Stop a subscription left behind by an earlier session
    Reset {
        #[clap(short, long)]
        port: u16,
        /// Delivery of the stale subscription, udp or tcp
        #[clap(short, long, default_value = "udp", value_parser = delivery_kind)]
        kind: DeliveryKind,
    },
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_sonar(s: &str) -> Result<u32, String> {
    match s.parse() {
        Ok(device @ (7125 | 7111)) => Ok(device),
        _ => Err("Sonar must be 7125 or 7111".to_string()),
    }
}

fn delivery_kind(s: &str) -> Result<DeliveryKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "udp" | "0" => Ok(DeliveryKind::Udp),
        "tcp" | "1" => Ok(DeliveryKind::Tcp),
        _ => Err("Expected udp or tcp".to_string()),
    }
}
