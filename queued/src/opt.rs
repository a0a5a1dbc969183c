use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(name = "queued", about = "Runs grading jobs inside docker sandboxes")]
pub struct Opts {
    /// Configuration file (`.json` or `.toml`)
    #[clap(long, short, name = "config-file-path")]
    pub config: PathBuf,

    /// Host of the admission listener, overrides `server_host`
    #[clap(long)]
    pub host: Option<String>,

    /// Port of the admission listener, overrides `server_port`
    #[clap(long, short)]
    pub port: Option<u16>,
}
