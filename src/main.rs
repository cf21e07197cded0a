use std::{
    io::{self, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use log::debug;
use rawcap::{Capture, CaptureSession, Config, Error};

const DEFAULT_OUTPUT: &str = "capture.pcap";

#[derive(Parser)]
#[command(name = "rawcap")]
#[command(version)]
#[command(about = "Capture TCP over IPv4 into a pcap file")]
struct Args {
    /// Output file; prompted for when omitted
    output: Option<PathBuf>,

    /// Local IPv4 address to bind the raw socket to
    #[arg(long)]
    bind: Option<Ipv4Addr>,

    /// Do not try to put the interface in promiscuous mode
    #[arg(long)]
    no_promisc: bool,

    /// Receive timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout: u64,
}

impl Args {
    fn config(&self) -> Config {
        let config = Config::new().promisc(!self.no_promisc).timeout(self.timeout);
        match self.bind {
            Some(addr) => config.bind_addr(addr),
            None => config,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    println!("rawcap - TCP packet capture");
    println!("===========================\n");

    let args = Args::parse();

    let output = match args.output.clone() {
        Some(path) => path,
        None => prompt_output().unwrap_or_else(|e| {
            eprintln!("Error: could not read output path: {e}");
            process::exit(1);
        }),
    };
    println!("Output file: {}", output.display());

    if let Err(e) = run(&args, &output) {
        eprintln!("\nError: {e}");
        if matches!(e, Error::CaptureInit(_)) || e.is_permission_denied() {
            eprintln!("\nNote: raw socket access requires root privileges (or CAP_NET_RAW).");
        }
        process::exit(1);
    }
}

fn run(args: &Args, output: &Path) -> Result<(), Error> {
    let session = Arc::new(CaptureSession::create(output)?);
    let mut cap = Capture::new(args.config(), session.clone());

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

    println!("\nStarting packet capture...");
    cap.start()?;
    println!("Capture started. Press Ctrl+C to stop.\n");

    loop {
        match stop_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                println!("\n\nStopping capture...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !cap.is_capturing() {
            debug!("receive loop ended on its own");
            break;
        }

        let count = session.packet_count();
        if count > 0 {
            print!("\rPackets captured: {count}");
            let _ = io::stdout().flush();
        }
    }

    let stopped = cap.stop();
    let finished = session.finish();
    stopped?;
    let total = finished?;

    println!("\nCapture stopped. Total packets captured: {total}");
    println!("Pcap file saved to {}", output.display());
    Ok(())
}

fn prompt_output() -> io::Result<PathBuf> {
    print!("Enter output file path (default: {DEFAULT_OUTPUT}): ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(output_or_default(&line))
}

fn output_or_default(input: &str) -> PathBuf {
    match input.trim() {
        "" => PathBuf::from(DEFAULT_OUTPUT),
        path => PathBuf::from(path),
    }
}
