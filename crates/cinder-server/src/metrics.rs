//! Server metrics.
//!
//! Recorded through the `metrics` facade: whatever recorder the embedding
//! application installs receives them, and with no recorder installed every
//! call is a no-op. Request and command gauges are incremented when a
//! dispatch starts and decremented when it finishes, on every path, so the
//! in-flight gauges always drain back to zero.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Called once per accepted connection.
#[inline]
pub(crate) fn on_connection_accepted() {
    gauge!("cinder_connections_active").increment(1.0);
    counter!("cinder_connections_total").increment(1);
}

/// Called once per connection teardown.
#[inline]
pub(crate) fn on_connection_closed() {
    gauge!("cinder_connections_active").decrement(1.0);
}

/// Marks a request and its commands as in flight.
#[inline]
pub(crate) fn on_request_started(names: &[String]) {
    gauge!("cinder_requests_in_flight").increment(1.0);
    for name in names {
        gauge!("cinder_commands_in_flight", "cmd" => name.clone()).increment(1.0);
    }
}

/// Balances [`on_request_started`].
#[inline]
pub(crate) fn on_request_finished(names: &[String]) {
    gauge!("cinder_requests_in_flight").decrement(1.0);
    for name in names {
        gauge!("cinder_commands_in_flight", "cmd" => name.clone()).decrement(1.0);
    }
}

/// Records the outcome of one dispatched request.
#[inline]
pub(crate) fn record_request(names: &[String], duration: Duration, is_error: bool) {
    histogram!("cinder_request_duration_seconds").record(duration.as_secs_f64());
    for name in names {
        counter!("cinder_commands_total", "cmd" => name.clone()).increment(1);
    }
    if is_error {
        counter!("cinder_request_errors_total").increment(1);
    }
}
