use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::models::Action;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    run_total: AtomicU64,
    command_total: AtomicU64,
    install_total: AtomicU64,
    succeeded_total: AtomicU64,
    nonzero_exit_total: AtomicU64,
    timed_out_total: AtomicU64,
    provider_error_total: AtomicU64,
    environments_provisioned_total: AtomicU64,
    environments_destroyed_total: AtomicU64,
    teardown_failed_total: AtomicU64,
    in_flight: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts the request and holds the in-flight gauge until the returned
    /// guard is dropped, including when the request future is cancelled.
    pub fn started(&self, action: Action) -> InFlight<'_> {
        let counter = match action {
            Action::Run => &self.run_total,
            Action::Command => &self.command_total,
            Action::Install => &self.install_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight { metrics: self }
    }

    pub fn finished(&self, exit_code: i32, timed_out: bool) {
        if timed_out {
            self.timed_out_total.fetch_add(1, Ordering::Relaxed);
        }
        if exit_code == 0 {
            self.succeeded_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nonzero_exit_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn provider_error(&self) {
        self.provider_error_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn environment_provisioned(&self) {
        self.environments_provisioned_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn environment_destroyed(&self) {
        self.environments_destroyed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn teardown_failed(&self) {
        self.teardown_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE execution_requests_total counter\n",
                "execution_requests_total{{action=\"run\"}} {}\n",
                "execution_requests_total{{action=\"command\"}} {}\n",
                "execution_requests_total{{action=\"install\"}} {}\n",
                "# TYPE execution_succeeded_total counter\n",
                "execution_succeeded_total {}\n",
                "# TYPE execution_nonzero_exit_total counter\n",
                "execution_nonzero_exit_total {}\n",
                "# TYPE execution_timed_out_total counter\n",
                "execution_timed_out_total {}\n",
                "# TYPE execution_provider_error_total counter\n",
                "execution_provider_error_total {}\n",
                "# TYPE environments_provisioned_total counter\n",
                "environments_provisioned_total {}\n",
                "# TYPE environments_destroyed_total counter\n",
                "environments_destroyed_total {}\n",
                "# TYPE environment_teardown_failed_total counter\n",
                "environment_teardown_failed_total {}\n",
                "# TYPE execution_in_flight gauge\n",
                "execution_in_flight {}\n"
            ),
            self.run_total.load(Ordering::Relaxed),
            self.command_total.load(Ordering::Relaxed),
            self.install_total.load(Ordering::Relaxed),
            self.succeeded_total.load(Ordering::Relaxed),
            self.nonzero_exit_total.load(Ordering::Relaxed),
            self.timed_out_total.load(Ordering::Relaxed),
            self.provider_error_total.load(Ordering::Relaxed),
            self.environments_provisioned_total.load(Ordering::Relaxed),
            self.environments_destroyed_total.load(Ordering::Relaxed),
            self.teardown_failed_total.load(Ordering::Relaxed),
            self.in_flight.load(Ordering::Relaxed),
        )
    }

    fn decrement_in_flight(&self) {
        let mut current = self.in_flight.load(Ordering::Relaxed);
        while current > 0 {
            match self.in_flight.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[must_use]
pub struct InFlight<'a> {
    metrics: &'a MetricsRegistry,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.decrement_in_flight();
    }
}
