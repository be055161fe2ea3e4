use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use _core::{logging, BoardConfig, OpenBci, Sample, StreamDispatcher, DEFAULT_BAUD};

#[derive(Parser, Debug)]
#[command(name = "openbci-demo", about = "Connect to an OpenBCI board and print samples")]
struct Args {
    /// Serial port (e.g., /dev/ttyUSB0). Auto-detected when omitted.
    #[arg(short, long)]
    port: Option<String>,
    #[arg(short, long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
    /// Expect a 16-channel daisy module even if the banner does not report one
    #[arg(long)]
    daisy: bool,
    /// Seconds to stream before stopping
    #[arg(short, long, default_value_t = 5.0)]
    seconds: f64,
    /// Print every sample instead of one per second
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_rust_logging();
    let lapse = Duration::try_from_secs_f64(args.seconds).context("invalid --seconds")?;

    let config = BoardConfig {
        port: args.port,
        baud: args.baud,
        daisy: args.daisy,
        logging: args.verbose,
        ..BoardConfig::default()
    };

    println!("--- Connecting to OpenBCI ---");
    let mut board = OpenBci::open(config).context("failed to open board")?;
    println!(
        "Connected on {} | {} EEG channels @ {} Hz",
        board.link().port_name().unwrap_or("?"),
        board.eeg_channel_count(),
        board.sample_rate()
    );

    let every = if args.verbose {
        1
    } else {
        (board.sample_rate() as u64).max(1)
    };
    let mut seen = 0u64;
    let mut dispatcher = StreamDispatcher::single(move |s: &Sample| {
        if seen % every == 0 {
            println!(
                "[{:03}] EEG(uV): {:.2?} | Aux(g): {:.3?}",
                s.packet_id, s.channel_data, s.aux_data
            );
        }
        seen += 1;
    });

    println!("Streaming for {:.1}s...", args.seconds);
    let summary = board.start_streaming(&mut dispatcher, Some(lapse))?;
    println!(
        "Done: {} samples in {:.2?} ({} malformed, {} unpaired, {} bytes skipped)",
        summary.samples_delivered,
        summary.elapsed,
        summary.packets_malformed,
        summary.pairing_gaps,
        summary.bytes_skipped
    );

    board.disconnect()?;
    Ok(())
}
