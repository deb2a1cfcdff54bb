//! Example: LFPS link-training capture
//!
//! Brings up the GTX transceiver, arms the LFPS analyzer on the polling
//! detector, and dumps the uploaded window to a waveform file.
//!
//! Usage:
//!   cargo run --release --example lfps_capture -- \
//!       --map csr.csv --map analyzer.csv \
//!       --endpoint localhost:1234 \
//!       --trigger soc_lfps_receiver_polling=1 \
//!       --offset 1024 --length 4096 \
//!       --output analyzer.vcd
//!
//! Over a serial bridge instead of the Etherbone server:
//!   cargo run --release --example lfps_capture -- \
//!       --map csr.csv --map analyzer.csv --uart /dev/ttyUSB1

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use usb3scope::bridge::Transport;
use usb3scope::trace::{self, WaveformFormat};
use usb3scope::{
    AddressMap, Analyzer, EtherboneTransport, RemoteClient, TriggerCondition, UartTransport, WaitPolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address map tables (repeat for csr.csv and analyzer.csv)
    #[arg(short, long, required = true)]
    map: Vec<PathBuf>,

    /// Etherbone bridge server
    #[arg(short, long, default_value = "localhost:1234")]
    endpoint: String,

    /// Serial bridge device (overrides --endpoint)
    #[arg(long)]
    uart: Option<PathBuf>,

    /// Analyzer register prefix
    #[arg(long, default_value = "lfps_analyzer")]
    analyzer: String,

    /// Trigger condition, e.g. "soc_lfps_receiver_polling=1" ("" = free-running)
    #[arg(short, long, default_value = "soc_lfps_receiver_polling=1")]
    trigger: String,

    /// Keep 1 of every N samples
    #[arg(long, default_value = "1")]
    subsample: u64,

    /// Samples before the trigger (default: a quarter of the window)
    #[arg(long)]
    offset: Option<usize>,

    /// Total samples to upload (default: the whole analyzer buffer)
    #[arg(long)]
    length: Option<usize>,

    /// Capture completion timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Skip transceiver bring-up
    #[arg(long)]
    no_gtx: bool,

    /// Output file; format follows the extension (vcd, csv, dsl)
    #[arg(short, long, default_value = "analyzer.vcd")]
    output: PathBuf,
}

/// Enable one transceiver direction and wait for its ready flag
fn enable_gtx<T: Transport>(
    client: &mut RemoteClient<T>,
    direction: &str,
    policy: &WaitPolicy,
) -> Result<(), Box<dyn std::error::Error>> {
    client.write(&format!("gtx_{}_enable", direction), 1)?;
    let ready = format!("gtx_{}_ready", direction);
    match client.poll(&ready, policy, |v| v != 0)? {
        Some(_) => {
            info!("GTX {} ready", direction.to_uppercase());
            Ok(())
        }
        None => Err(format!("{} still low after {:?}", ready, policy.timeout).into()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let format = WaveformFormat::from_path(&args.output)
        .ok_or_else(|| format!("cannot tell waveform format of {}", args.output.display()))?;
    let condition = TriggerCondition::parse(&args.trigger)?;
    let map = AddressMap::load_files(&args.map)?;

    let transport: Box<dyn Transport> = match &args.uart {
        Some(path) => Box::new(UartTransport::new(path)),
        None => Box::new(EtherboneTransport::new(&args.endpoint)),
    };
    let mut client = RemoteClient::new(transport, map);
    client.open()?;

    info!("FPGA: {}", client.identifier()?);

    if !args.no_gtx {
        let policy = WaitPolicy::new(Duration::from_secs(args.timeout));
        client.write("gtx_rx_polarity", 0)?;
        enable_gtx(&mut client, "tx", &policy)?;
        enable_gtx(&mut client, "rx", &policy)?;
    }

    let uploaded = {
        let mut analyzer = Analyzer::new(&mut client, &args.analyzer)?
            .with_policy(WaitPolicy::new(Duration::from_secs(args.timeout)));
        analyzer.configure_subsampler(args.subsample)?;
        analyzer.configure_trigger(&condition)?;
        let length = args.length.unwrap_or(analyzer.depth());
        let offset = args.offset.unwrap_or(length / 4);
        analyzer.run(offset, length)?;
        analyzer.wait_done()?;
        analyzer.upload()?
    };

    let decoded = trace::decode(&uploaded, uploaded.layout());
    trace::save(&decoded, &args.output, format)?;
    println!(
        "{} samples of {} signals written to {}",
        decoded.len(),
        decoded.signals.len(),
        args.output.display()
    );

    client.close();
    Ok(())
}
