use gpuherd_common::{Instance, InstanceStatus, PolicySettings, UtilizationSample};

/// Decide what happens to an instance this cycle. Pure: the same inputs
/// always produce the same status, and nothing here touches the store or the
/// provider. Samples must be ascending by `taken_at`.
pub fn decide(
    instance: &Instance,
    samples: &[UtilizationSample],
    now: i64,
    settings: &PolicySettings,
) -> InstanceStatus {
    if instance.is_whitelisted() {
        return InstanceStatus::Whitelisted;
    }

    let runtime = now - instance.launched_at;
    let idle_run = trailing_idle_run(samples, now, settings.poll_interval_secs);
    let idle_qualifies = idle_run >= settings.idle_shutdown_secs;

    if runtime < settings.min_runtime_secs {
        return if idle_qualifies {
            InstanceStatus::Protected
        } else {
            InstanceStatus::Active
        };
    }

    if idle_qualifies {
        return InstanceStatus::Terminate;
    }

    // Informational only: a fresh all-zero sample reads as idle, anything
    // else as active.
    match samples.last() {
        Some(latest) if latest.all_idle() => InstanceStatus::Idle,
        _ => InstanceStatus::Active,
    }
}

/// Length in seconds of the maximal trailing span, ending at `now`, in which
/// every sample reports all GPUs at 0%. A gap wider than twice the poll
/// interval (between consecutive samples, or between `now` and the newest
/// sample) breaks the span: missing data is unknown, not idle, so a polling
/// outage can never read as sustained idleness.
pub fn trailing_idle_run(samples: &[UtilizationSample], now: i64, poll_interval_secs: i64) -> i64 {
    let max_gap = 2 * poll_interval_secs;
    let mut span_end = now;
    let mut span_start = None;

    for sample in samples.iter().rev() {
        if span_end - sample.taken_at > max_gap {
            break;
        }
        if !sample.all_idle() {
            break;
        }
        span_start = Some(sample.taken_at);
        span_end = sample.taken_at;
    }

    match span_start {
        Some(start) => now - start,
        None => 0,
    }
}
