//! Edge viewer binary
use clap::Parser;
use tracing::{error, info};
use vigil::components::prelude::*;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Multiplexer Component.
    #[arg(short, long)]
    filepath: String,
}

/// Log what the viewer would currently display.
fn log_snapshot(multiplexer: &Multiplexer) {
    let stats = multiplexer.stats();
    let sensor = multiplexer.sensor_snapshot();
    let lux = sensor
        .as_ref()
        .and_then(|stamped| stamped.value.lux)
        .map(|lux| lux.get());
    let sensor_age_ms = sensor.map(|stamped| stamped.arrival.elapsed().as_millis() as u64);
    let analysis = multiplexer.latest_analysis();
    info!(
        accepted = stats.accepted,
        video_frames = stats.video_frames,
        malformed = stats.malformed,
        unknown = stats.unknown,
        frame_bytes = multiplexer.latest_frame().map(|frame| frame.bytes.len()),
        lux,
        sensor_age_ms,
        danger = analysis.as_ref().map(|result| result.danger),
        description = analysis.as_ref().map(|result| result.description.as_str()),
        chart = multiplexer.latest_chart_data().is_some(),
        "viewer snapshot"
    );
}

#[tokio::main]
async fn main() {
    vigil::logging::init("info");
    let args = Args::parse();
    let mut multiplexer = match Multiplexer::from_config_file(&args.filepath) {
        Ok(multiplexer) => multiplexer,
        Err(e) => {
            error!(filepath = %args.filepath, error = %e, "failed to read viewer config");
            std::process::exit(1);
        }
    };
    if let Err(e) = multiplexer.start().await {
        error!(error = %e, "failed to start multiplexer");
        std::process::exit(1);
    }

    let mut status = tokio::time::interval(multiplexer.config().status_period());
    loop {
        tokio::select! {
            _ = status.tick() => log_snapshot(&multiplexer),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to wait for ctrl-c");
                }
                break;
            }
        }
    }
    info!("shutting down");
    multiplexer.stop().await;
}
