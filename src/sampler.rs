use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Networks, Pid, System};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics::{MetricsEngine, Sample, SystemSample};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Periodic snapshot of this process: CPU, resident memory and cumulative
/// network traffic of the host interfaces.
pub struct SystemSampler {
    system: System,
    networks: Networks,
    pid: Option<Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(error = err, "process metrics unavailable");
                None
            }
        };
        let mut system = System::new();
        system.refresh_memory();
        if let Some(pid) = pid {
            system.refresh_process(pid);
        }
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            pid,
        }
    }

    /// Refresh and read one sample. Readings the platform cannot provide
    /// are left out.
    pub fn sample(&mut self) -> SystemSample {
        self.system.refresh_memory();
        self.networks.refresh();

        let total_mb = self.system.total_memory() as f64 / BYTES_PER_MB;
        let mut sample = SystemSample {
            memory_available_mb: Some(self.system.available_memory() as f64 / BYTES_PER_MB),
            ..Default::default()
        };

        if let Some(pid) = self.pid {
            self.system.refresh_process(pid);
            if let Some(process) = self.system.process(pid) {
                let used_mb = process.memory() as f64 / BYTES_PER_MB;
                sample.cpu_percent = Some(f64::from(process.cpu_usage()));
                sample.memory_used_mb = Some(used_mb);
                if total_mb > 0.0 {
                    sample.memory_percent = Some(used_mb / total_mb * 100.0);
                }
            }
        }

        let (sent, recv) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(sent, recv), (_, data)| {
                (sent + data.total_transmitted(), recv + data.total_received())
            });
        sample.net_sent_bytes = Some(sent as f64);
        sample.net_recv_bytes = Some(recv as f64);
        sample
    }

    /// Ingest a sample every `interval` until the engine shuts down.
    pub async fn run(
        mut self,
        engine: Arc<MetricsEngine>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "system sampler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = self.sample();
                    engine.ingest(Sample::system(engine.now(), sample));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("system sampler stopped");
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
