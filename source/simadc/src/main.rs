use std::{sync::Arc, time::Duration};

use clap::Parser;
use tracing::{error, info, warn};

use dmacap::{ChannelServer, ChannelSettings, CoherentBuffer, DmaChannel, TransferStatus};

mod cli;
mod sim_engine;

use sim_engine::{SimAcquisition, SAMPLE_BYTES};

fn main() {
    let args = cli::Args::parse();
    cli::setup_tracing();
    run_capture(args);
}

#[tokio::main(flavor = "current_thread")]
async fn run_capture(args: cli::Args) {
    let buffer = match CoherentBuffer::allocate(args.capacity, SAMPLE_BYTES) {
        Ok(buffer) => Arc::new(buffer),
        Err(error) => {
            error!(?error, capacity = args.capacity, "buffer allocation failed");
            return;
        }
    };

    let engine = SimAcquisition::new(Duration::from_micros(args.sample_period_us));
    let channel = Arc::new(DmaChannel::new(
        engine,
        buffer,
        ChannelSettings::default(),
    ));
    let (server, client) = ChannelServer::new(channel, 8);
    tokio::spawn(server.run());

    info!(
        capacity = args.capacity,
        capture_bytes = args.capture_bytes,
        captures = args.captures,
        "capture session starting"
    );

    if let Err(error) = client.set_timeout(args.timeout_ms).await {
        error!(?error, "channel unavailable");
        return;
    }
    let view = match client.map_buffer(0, args.capture_bytes).await {
        Ok(view) => view,
        Err(error) => {
            error!(?error, "mapping the capture region failed");
            return;
        }
    };

    for capture in 0..args.captures {
        if let Err(error) = client.submit(args.capture_bytes).await {
            warn!(capture, ?error, "submit refused");
            break;
        }
        match client.wait().await {
            Ok(TransferStatus::Complete) => {
                let (min, max, mean) = summarize(view.as_slice());
                info!(capture, min, max, mean, "capture complete");
            }
            Ok(status) => {
                warn!(capture, ?status, "capture did not complete");
                break;
            }
            Err(error) => {
                error!(capture, ?error, "channel unavailable");
                break;
            }
        }
    }

    if let Err(error) = client.close().await {
        warn!(?error, "close failed");
    }
    info!("capture session finished");
}

/// Min/max/mean of the captured samples, read as little-endian `u32`s.
fn summarize(bytes: &[u8]) -> (u32, u32, u32) {
    let mut min = u32::MAX;
    let mut max = 0u32;
    let mut sum = 0u64;
    let mut count = 0u64;
    for chunk in bytes.chunks_exact(SAMPLE_BYTES) {
        let sample = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        min = min.min(sample);
        max = max.max(sample);
        sum += u64::from(sample);
        count += 1;
    }
    if count == 0 {
        return (0, 0, 0);
    }
    (min, max, (sum / count) as u32)
}
