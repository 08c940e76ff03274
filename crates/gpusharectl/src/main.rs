//! A command-line utility to configure the gpushare scheduler.
//!
//! Each invocation opens a fresh connection per requested action, sends
//! exactly one frame, and closes. The tool never registers as a client,
//! so the scheduler simply reaps the connection afterwards.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use gpushare_proto::transport;
use gpushare_proto::{Message, MessageType};

/// Frames originated by the control tool carry this id.
const CONTROL_FRAME_ID: u64 = 0xBEEF;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

/// Configure the gpushare scheduler.
#[derive(Parser, Debug)]
#[command(name = "gpusharectl", version, arg_required_else_help = true)]
struct Cli {
    /// Turn anti-thrash scheduling on or off.
    #[clap(long, value_enum)]
    anti_thrash: Option<Switch>,

    /// Set the time quantum of the scheduler in seconds. Only accepts
    /// positive integers.
    #[clap(long, value_name = "SECONDS", value_parser = parse_quantum)]
    set_tq: Option<u64>,

    /// Path to the scheduler socket.
    #[clap(long, default_value_os_t = transport::default_socket_path())]
    socket_path: PathBuf,
}

fn parse_quantum(s: &str) -> Result<u64, String> {
    match s.parse::<i64>() {
        Ok(q) if q > 0 => Ok(q as u64),
        _ => Err("time quantum must be a positive integer".into()),
    }
}

fn send_one(cli: &Cli, msg: &Message) -> anyhow::Result<()> {
    let stream = transport::connect(&cli.socket_path)?;
    transport::write_frame(&stream, msg)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(switch) = cli.anti_thrash {
        let kind = match switch {
            Switch::On => MessageType::SchedOn,
            Switch::Off => MessageType::SchedOff,
        };
        send_one(&cli, &Message::new(kind, CONTROL_FRAME_ID))?;
        tracing::info!(
            "Successfully turned anti-thrash scheduling {}.",
            match switch {
                Switch::On => "on",
                Switch::Off => "off",
            }
        );
    }

    if let Some(quantum) = cli.set_tq {
        let mut msg = Message::new(MessageType::SetTq, CONTROL_FRAME_ID);
        msg.set_quantum(quantum);
        send_one(&cli, &msg)?;
        tracing::info!("Successfully set the scheduler time quantum to {quantum} seconds.");
    }

    Ok(())
}
