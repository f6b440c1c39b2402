use clap::Parser;

const ENV_FILTER: &str = "SIMADC_TRACE";

#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Size of the capture buffer in bytes.
    #[clap(long, default_value_t = 2 * 1024 * 1024)]
    pub capacity: usize,

    /// Bytes to capture per transfer. Must be a multiple of the sample
    /// width (4 bytes).
    #[clap(long, default_value_t = 4096)]
    pub capture_bytes: u32,

    /// Number of captures to run before exiting.
    #[clap(long, default_value_t = 3)]
    pub captures: u32,

    /// Wait deadline per capture, in milliseconds.
    #[clap(long, default_value_t = 10_000)]
    pub timeout_ms: u32,

    /// Simulated acquisition time per sample, in microseconds.
    #[clap(long, default_value_t = 10)]
    pub sample_period_us: u64,
}

pub fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(ENV_FILTER)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
