// src/main.rs
//
// Headless front end for the serial session core.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use serialdeck::logging::init_file_logging;
use serialdeck::settings::{load_settings, load_settings_from};
use serialdeck::{
    tlog, FlashRequest, PortOptions, RecordOrder, RecordingOptions, SerialService, SerialServiceHandle,
    SerialTransport, ServiceEvent, Settings, SystemTransport, TimestampMode,
};

#[derive(Parser)]
#[command(name = "serialdeck", version, about = "Serial port monitor, CSV recorder and firmware flasher")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Mirror log output to a timestamped file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports
    Ports,
    /// Print decoded rows and fast frames until Ctrl-C
    Monitor(PortArgs),
    /// Record a port to CSV
    Record(RecordArgs),
    /// Touch, upload and reset a device with mcumgr
    Flash(FlashArgs),
}

#[derive(Args)]
struct PortArgs {
    /// Port path, e.g. /dev/ttyACM0 or COM3
    path: String,

    #[arg(long)]
    baud: Option<u32>,

    /// Field separator
    #[arg(long)]
    separator: Option<String>,

    /// End of line, escapes allowed ("\r\n")
    #[arg(long)]
    eol: Option<String>,
}

#[derive(Args)]
struct RecordArgs {
    #[command(flatten)]
    port: PortArgs,

    /// Output CSV file
    file: PathBuf,

    #[arg(long, value_enum, default_value_t = OrderArg::Oldest)]
    order: OrderArg,

    /// Write a header row
    #[arg(long)]
    header: bool,

    #[arg(long, value_enum, default_value_t = TimestampArg::None)]
    timestamp: TimestampArg,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    seconds: Option<u64>,
}

#[derive(Args)]
struct FlashArgs {
    port: String,
    firmware: PathBuf,

    /// Management tool binary
    #[arg(long)]
    tool: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Oldest,
    Newest,
}

#[derive(Clone, Copy, ValueEnum)]
enum TimestampArg {
    None,
    Relative,
    Absolute,
}

impl From<OrderArg> for RecordOrder {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Oldest => RecordOrder::OldestFirst,
            OrderArg::Newest => RecordOrder::NewestFirst,
        }
    }
}

impl From<TimestampArg> for TimestampMode {
    fn from(arg: TimestampArg) -> Self {
        match arg {
            TimestampArg::None => TimestampMode::None,
            TimestampArg::Relative => TimestampMode::Relative,
            TimestampArg::Absolute => TimestampMode::Absolute,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    }
    .unwrap_or_else(|e| {
        tlog!("[settings] Using defaults: {}", e);
        Settings::default()
    });

    let file_log = cli
        .log_dir
        .as_ref()
        .or(settings.log_dir.as_ref())
        .and_then(|dir| match init_file_logging(dir) {
            Ok(log) => Some(log),
            Err(e) => {
                tlog!("[logging] File logging disabled: {}", e);
                None
            }
        });

    let result = match cli.command {
        Command::Ports => list_ports(&settings),
        Command::Monitor(args) => monitor(&settings, args).await,
        Command::Record(args) => record(&settings, args).await,
        Command::Flash(args) => flash(&settings, args).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        drop(file_log);
        std::process::exit(1);
    }
}

fn port_options(settings: &Settings, args: &PortArgs) -> PortOptions {
    let defaults = settings.port_options();
    PortOptions {
        baud_rate: args.baud.unwrap_or(defaults.baud_rate),
        separator: args.separator.clone().unwrap_or(defaults.separator),
        eol: args.eol.clone().unwrap_or(defaults.eol),
    }
}

fn start_service(settings: &Settings) -> SerialServiceHandle {
    let transport = Arc::new(SystemTransport::new(settings.read_timeout()));
    SerialService::start(settings, transport)
}

fn list_ports(settings: &Settings) -> serialdeck::Result<()> {
    let ports = SystemTransport::new(settings.read_timeout()).available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.product.as_deref().or(port.manufacturer.as_deref()) {
            Some(desc) => println!("{}\t{}\t{}", port.path, port.port_type, desc),
            None => println!("{}\t{}", port.path, port.port_type),
        }
    }
    Ok(())
}

async fn monitor(settings: &Settings, args: PortArgs) -> serialdeck::Result<()> {
    let svc = start_service(settings);
    let mut events = svc.subscribe();
    svc.open(&args.path, port_options(settings, &args)).await?;

    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut last_row = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ServiceEvent::FastFrame { frame, .. }) => {
                    println!(
                        "frame: {} columns x {} rows [{}]",
                        frame.column_count(),
                        frame.row_count(),
                        frame.headers.join(", ")
                    );
                }
                Ok(ServiceEvent::PortClosed { reason, .. }) => {
                    println!("port closed: {}", reason);
                    break;
                }
                _ => {}
            },
            _ = tick.tick() => {
                let row = svc.latest_row(&args.path).await?;
                if !row.is_empty() && row != last_row {
                    let text: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                    println!("{}", text.join("\t"));
                    last_row = row;
                }
            }
        }
    }

    svc.shutdown().await
}

async fn record(settings: &Settings, args: RecordArgs) -> serialdeck::Result<()> {
    let svc = start_service(settings);
    let options = port_options(settings, &args.port);
    let path = args.port.path.clone();
    svc.open(&path, options.clone()).await?;

    let recording = RecordingOptions {
        file_path: args.file.clone(),
        separator: options.separator,
        eol: options.eol,
        order: args.order.into(),
        add_header: args.header,
        timestamp: args.timestamp.into(),
    };
    println!("{}", svc.start_recording(&path, recording).await?);

    match args.seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    println!("{}", svc.stop_recording(&path).await?);
    println!("{}", svc.close(&path).await?);
    svc.shutdown().await
}

async fn flash(settings: &Settings, args: FlashArgs) -> serialdeck::Result<()> {
    let svc = start_service(settings);
    let mut events = svc.subscribe();
    svc.start_flash(FlashRequest {
        port: args.port,
        firmware: args.firmware,
        tool: args.tool,
    })
    .await?;

    let mut success = false;
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                svc.cancel_flash();
            }
            event = events.recv() => match event {
                Ok(ServiceEvent::FlashProgress { message }) => println!("{}", message),
                Ok(ServiceEvent::FlashComplete { success: ok, .. }) => {
                    success = ok;
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    svc.shutdown().await?;
    if !success {
        std::process::exit(2);
    }
    Ok(())
}
