use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Records sidecar: newline-delimited JSON requests on stdin, one response per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "schoold", version)]
pub struct Config {
    /// Workspace directory to open at startup
    #[arg(long, env = "SCHOOLD_WORKSPACE", value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    /// Log filter directive (stderr only; stdout carries responses)
    #[arg(long = "log", env = "SCHOOLD_LOG", default_value = "info")]
    pub log_filter: String,
}

pub fn init_logging(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
}
