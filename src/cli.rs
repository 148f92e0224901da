use clap::Parser;
use std::path::PathBuf;

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Display: virtual (simulated vsync)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Frame-accurate video playout server with an HTTP control plane
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Display backend to drive (currently: virtual)
    #[arg(long = "dev", value_name = "BACKEND", default_value = "virtual")]
    pub dev: String,

    /// TCP port for the HTTP control plane
    #[arg(long = "port", value_name = "PORT", default_value_t = 31415)]
    pub port: u16,

    /// Media directory scripts may reference
    #[arg(long = "media-root", value_name = "DIR")]
    pub media_root: PathBuf,

    /// Allow non-localhost connections
    #[arg(long = "trust-network")]
    pub trust_network: bool,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}
