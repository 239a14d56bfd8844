// The binary uses the library, not duplicate modules
use geofence_replay::{Settings, logging, run};
use std::process::ExitCode;

fn main() -> ExitCode {
    logging::setup_logging();
    let settings = Settings::from_cli();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start the async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(&settings)) {
        Ok(summary) => {
            let stats = summary.stats;
            tracing::info!(
                samples = summary.samples,
                rejected = stats.rejected_samples,
                events = summary.events_written,
                dropped = summary.events_dropped,
                exact_tests = stats.exact_tests,
                bbox_rejections = stats.bbox_rejections,
                evicted = stats.evicted_vehicles,
                "Replay finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
