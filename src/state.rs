use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Running totals kept under the pool lock
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub request_count: u64,
    pub accumulated_request_time: Duration,
    pub accumulated_checkout_time: Duration,
    pub claimed_overdue_count: u64,
    pub accumulated_overdue_checkout_time: Duration,
    pub had_to_wait_count: u64,
    pub accumulated_wait_time: Duration,
    pub bad_connection_count: u64,
}

/// Snapshot of the connection pool
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct State {
    pub max_active: u64,
    pub max_idle: u64,
    /// Checked out right now
    pub active: u64,
    /// Open and unused
    pub idle: u64,
    /// Callers currently inside `get`
    pub waits: u64,
    pub request_count: u64,
    pub accumulated_request_time: Duration,
    pub accumulated_checkout_time: Duration,
    pub claimed_overdue_count: u64,
    pub accumulated_overdue_checkout_time: Duration,
    pub had_to_wait_count: u64,
    pub accumulated_wait_time: Duration,
    pub bad_connection_count: u64,
}

impl State {
    pub(crate) fn new(
        max_active: usize,
        max_idle: usize,
        active: usize,
        idle: usize,
        waits: u64,
        c: &Counters,
    ) -> Self {
        Self {
            max_active: max_active as u64,
            max_idle: max_idle as u64,
            active: active as u64,
            idle: idle as u64,
            waits,
            request_count: c.request_count,
            accumulated_request_time: c.accumulated_request_time,
            accumulated_checkout_time: c.accumulated_checkout_time,
            claimed_overdue_count: c.claimed_overdue_count,
            accumulated_overdue_checkout_time: c.accumulated_overdue_checkout_time,
            had_to_wait_count: c.had_to_wait_count,
            accumulated_wait_time: c.accumulated_wait_time,
            bad_connection_count: c.bad_connection_count,
        }
    }

    pub fn average_request_time(&self) -> Duration {
        average(self.accumulated_request_time, self.request_count)
    }

    pub fn average_wait_time(&self) -> Duration {
        average(self.accumulated_wait_time, self.had_to_wait_count)
    }

    /// Averaged over requests, like the accumulated checkout time itself.
    pub fn average_checkout_time(&self) -> Duration {
        average(self.accumulated_checkout_time, self.request_count)
    }

    pub fn average_overdue_checkout_time(&self) -> Duration {
        average(
            self.accumulated_overdue_checkout_time,
            self.claimed_overdue_count,
        )
    }
}

fn average(total: Duration, n: u64) -> Duration {
    match u32::try_from(n) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_nanos((total.as_nanos() / n as u128) as u64),
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ max_active: {}, max_idle: {}, active: {}, idle: {}, waits: {}, requests: {}, avg_request: {:?}, avg_checkout: {:?}, claimed_overdue: {}, avg_overdue: {:?}, had_to_wait: {}, avg_wait: {:?}, bad_connections: {} }}",
            self.max_active,
            self.max_idle,
            self.active,
            self.idle,
            self.waits,
            self.request_count,
            self.average_request_time(),
            self.average_checkout_time(),
            self.claimed_overdue_count,
            self.average_overdue_checkout_time(),
            self.had_to_wait_count,
            self.average_wait_time(),
            self.bad_connection_count
        )
    }
}
