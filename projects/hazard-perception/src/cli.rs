use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON system configuration; built-in defaults when omitted
    #[arg(long, env = "HAZARD_PERCEPTION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured video source (camera index, file or URL)
    #[arg(long, env = "HAZARD_PERCEPTION_SOURCE")]
    pub source: Option<String>,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 12206)]
    pub port: u16,

    /// Process the source without the control server, stopping at end of file
    #[arg(long)]
    pub headless: bool,

    /// Ego vehicle speed in km/h
    #[arg(long, default_value_t = 0.0)]
    pub vehicle_speed: f32,

    /// Write the latest analysis results here on exit
    #[arg(long)]
    pub results_out: Option<PathBuf>,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    pub dump_config: Option<PathBuf>,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
