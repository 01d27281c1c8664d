use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ecg-stream",
    version,
    about = "Real-time multi-lead ECG waveform pipeline",
    long_about = "Normalize device messages, replay recorded captures, and stream live ECG data.\n\
                  Session settings are read from a JSON file given by --config or $ECG_STREAM_CONFIG."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Session configuration file (JSON)
    #[arg(long, env = "ECG_STREAM_CONFIG", global = true)]
    pub config: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Parse device messages into per-lead sample batches
    Normalize(NormalizeArgs),
    /// Replay a recorded capture in review mode
    Replay(ReplayArgs),
    /// Connect to a live source and ingest until stopped
    Stream(StreamArgs),
}

#[derive(Args)]
pub struct NormalizeArgs {
    /// A single raw message
    #[arg(conflicts_with = "file")]
    pub message: Option<String>,

    /// File with one raw message per line
    #[arg(long)]
    pub file: Option<String>,

    /// Output compact JSON
    #[arg(long)]
    pub compact: bool,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<String>,
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Capture file, one raw message per line
    #[arg(long)]
    pub file: String,

    /// 0-based lead index to replay (default: lead II)
    #[arg(long, default_value_t = 1)]
    pub lead: usize,

    /// Playback speed, clamped to 0.25..4
    #[arg(long, default_value_t = 1.0)]
    pub speed: f32,

    /// Zoom level, clamped to 0.5..5
    #[arg(long, default_value_t = 1.0)]
    pub zoom: f32,

    /// Viewport width in pixels
    #[arg(long)]
    pub width: Option<f32>,

    /// Viewport height in pixels, used for the rendered trace
    #[arg(long, default_value_t = 300.0)]
    pub height: f32,

    /// Include the projected polylines of the final frame
    #[arg(long)]
    pub render: bool,

    /// Output compact JSON
    #[arg(long)]
    pub compact: bool,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<String>,
}

#[derive(Args)]
pub struct StreamArgs {
    /// WebSocket URL of the device or bridge
    #[arg(long, conflicts_with_all = ["capture", "simulate"])]
    pub url: Option<String>,

    /// Stream a capture file, one message per line
    #[arg(long, conflicts_with = "simulate")]
    pub capture: Option<String>,

    /// Delay between capture lines in milliseconds
    #[arg(long, requires = "capture")]
    pub rate_limit_ms: Option<u64>,

    /// Loop the capture at end of file
    #[arg(long, requires = "capture")]
    pub loop_playback: bool,

    /// Generate synthetic 12-lead data
    #[arg(long)]
    pub simulate: bool,

    /// Interval between simulated messages in milliseconds
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    /// Number of leads the source is expected to deliver
    #[arg(long, default_value_t = 12)]
    pub leads: usize,

    /// Stop after this many seconds (default: until Ctrl-C or end of stream)
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Print session events as JSON lines while streaming
    #[arg(long)]
    pub events: bool,

    /// Disable reconnection after transport failures
    #[arg(long)]
    pub no_reconnect: bool,

    /// Output compact JSON
    #[arg(long)]
    pub compact: bool,
}
