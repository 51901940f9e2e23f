use super::{types::Config, ConfigError};

fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(message.into()))
}

/// Validate configuration
/// Currently validates:
/// - Lease, heartbeat and poll timings are non-zero and the heartbeat fits
///   inside the lease
/// - At least one attempt per stage
/// - The render watchdog samples output more often than its idle threshold
/// - Heartbeat rows outlive the liveness window
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let worker = &config.worker;
    if worker.lease_secs == 0 {
        return invalid("worker.lease_secs cannot be 0");
    }
    if worker.poll_interval_ms == 0 {
        return invalid("worker.poll_interval_ms cannot be 0");
    }
    if worker.heartbeat_interval_secs == 0 {
        return invalid("worker.heartbeat_interval_secs cannot be 0");
    }
    if worker.heartbeat_interval_secs >= worker.lease_secs {
        return invalid(format!(
            "worker.heartbeat_interval_secs ({}) must be shorter than worker.lease_secs ({})",
            worker.heartbeat_interval_secs, worker.lease_secs
        ));
    }

    let pipeline = &config.pipeline;
    if pipeline.max_attempts == 0 {
        return invalid("pipeline.max_attempts cannot be 0");
    }
    if pipeline.stale_reclaim_limit == 0 {
        return invalid("pipeline.stale_reclaim_limit cannot be 0");
    }

    let render = &config.render;
    if render.poll_interval_ms == 0 {
        return invalid("render.poll_interval_ms cannot be 0");
    }
    if render.idle_threshold() < render.poll_interval() {
        return invalid(format!(
            "render.idle_threshold_secs ({}) is shorter than render.poll_interval_ms ({})",
            render.idle_threshold_secs, render.poll_interval_ms
        ));
    }

    if config.reaper.interval_secs == 0 {
        return invalid("reaper.interval_secs cannot be 0");
    }
    if config.reaper.heartbeat_retention_secs <= worker.liveness_window_secs {
        return invalid(format!(
            "reaper.heartbeat_retention_secs ({}) must exceed worker.liveness_window_secs ({})",
            config.reaper.heartbeat_retention_secs, worker.liveness_window_secs
        ));
    }

    Ok(())
}
