//! Counter hooks. A no-op unless the `metrics` feature is enabled.

/// Countable broker events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CommandDelivered,
    UpdateClaimed,
    TunnelOpened,
    ProxyJobTimedOut,
}

#[cfg(feature = "metrics")]
pub fn count(event: Event, n: u64) {
    let meters = outpost_core::metrics::broker_meters();
    let counter = match event {
        Event::CommandDelivered => &meters.commands_delivered,
        Event::UpdateClaimed => &meters.updates_claimed,
        Event::TunnelOpened => &meters.tunnels_opened,
        Event::ProxyJobTimedOut => &meters.proxy_jobs_timed_out,
    };
    counter.add(n, &[]);
}

#[cfg(not(feature = "metrics"))]
pub const fn count(_event: Event, _n: u64) {}
