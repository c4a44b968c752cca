use std::io::{self, Write};
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use crossterm::{
    cursor::MoveTo,
    execute,
    terminal::{Clear, ClearType},
};
use tokio::sync::mpsc;

use pcap_receiver::{CaptureSession, Config, ExportFormat, ForwardNotice, Mode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive frames from a UDP packet exporter and show their payloads")]
struct Args {
    /// JSON config file; missing file means defaults
    #[arg(short, long, default_value = "pcap-receiver.json")]
    config: PathBuf,

    /// Address to bind the receiver on
    #[arg(long)]
    bind: Option<IpAddr>,

    /// UDP port the exporter sends to
    #[arg(short, long)]
    port: Option<u16>,

    /// Application the exporter should filter on
    #[arg(short = 'a', long)]
    target_app: Option<String>,

    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long)]
    start_marker: Option<String>,

    #[arg(long)]
    end_marker: Option<String>,

    /// POST every pattern match to this URL
    #[arg(long)]
    forward_url: Option<String>,

    /// Flush tick in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Log buffer cap in characters
    #[arg(long)]
    max_log: Option<usize>,

    #[arg(long, value_enum)]
    export_format: Option<FormatArg>,

    /// Print each update below the previous one instead of redrawing
    #[arg(long, default_value_t = false)]
    no_clear: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Raw,
    Pattern,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Pcap,
    Raw,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(app) = &self.target_app {
            config.target_app = app.trim().to_string();
        }
        if let Some(mode) = self.mode {
            config.mode = match mode {
                ModeArg::Raw => Mode::Raw,
                ModeArg::Pattern => Mode::Pattern,
            };
        }
        if let Some(marker) = &self.start_marker {
            config.start_marker = marker.clone();
        }
        if let Some(marker) = &self.end_marker {
            config.end_marker = marker.clone();
        }
        if let Some(url) = &self.forward_url {
            config.forward_url = Some(url.clone());
        }
        if let Some(ms) = self.interval_ms {
            config.update_interval_ms = ms;
        }
        if let Some(max) = self.max_log {
            config.max_log_buffer = max;
        }
        if let Some(format) = self.export_format {
            config.export_format = match format {
                FormatArg::Pcap => ExportFormat::Pcap,
                FormatArg::Raw => ExportFormat::Raw,
            };
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    args.apply(&mut config);

    println!("Configure the exporter with:");
    for (key, value) in config.exporter_settings() {
        println!("  {key} = {value}");
    }

    let (text_tx, mut text_rx) = mpsc::unbounded_channel::<String>();
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<ForwardNotice>();

    let session = CaptureSession::start_with_notices(
        &config,
        move |text: String| {
            let _ = text_tx.send(text);
        },
        Some(notice_tx),
    )
    .await
    .context("Failed to start capture session")?;

    if let Some(addr) = session.local_addr() {
        log::info!("Receiver ready on {} ({:?} mode), Ctrl-C to stop", addr, config.mode);
    }

    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(text) = text_rx.recv() => show(&mut stdout, &text, args.no_clear)?,
            Some(notice) = notice_rx.recv() => match notice {
                ForwardNotice::Delivered { value, status } => {
                    log::info!("Sent {} ({})", value, status);
                }
                ForwardNotice::Failed { value, reason } => {
                    log::warn!("Could not send {}: {}", value, reason);
                }
            },
        }
    }

    let report = session.stop(None).await.context("Failed to stop capture session")?;
    while let Ok(text) = text_rx.try_recv() {
        show(&mut stdout, &text, args.no_clear)?;
    }

    let stats = report.listener;
    println!(
        "\nDatagrams: {} ({} bytes), decoded: {}, empty: {}, dropped: {}, receive errors: {}",
        stats.datagrams, stats.bytes, stats.decoded, stats.empty, stats.dropped, stats.receive_errors
    );
    Ok(())
}

fn show(stdout: &mut io::Stdout, text: &str, no_clear: bool) -> io::Result<()> {
    if !no_clear {
        execute!(stdout, Clear(ClearType::All), MoveTo(0, 0))?;
    }
    writeln!(stdout, "{text}")?;
    stdout.flush()
}
