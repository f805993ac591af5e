use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum JobOutcome {
    Success,
    Error,
    Timeout,
    Cancelled,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub kind: String,
    pub outcome: JobOutcome,
}

fn job_duration_histogram() -> Histogram {
    // 50ms .. ~200s
    Histogram::new(exponential_buckets(0.05, 2.0, 13))
}

/// Worker pool instrumentation. Cloning shares the underlying series.
#[derive(Clone, Debug)]
pub struct PoolMetrics {
    pub job_duration_seconds: Family<JobLabels, Histogram>,
    pub jobs_total: Family<OutcomeLabels, Counter>,
    pub queue_dropped_total: Counter,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self {
            job_duration_seconds: Family::new_with_constructor(job_duration_histogram),
            jobs_total: Family::default(),
            queue_dropped_total: Counter::default(),
        }
    }
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registry: &mut Registry) {
        let sub_registry = registry.sub_registry_with_prefix("finsync");
        sub_registry.register(
            "job_duration_seconds",
            "Wall time of one pool job",
            self.job_duration_seconds.clone(),
        );
        sub_registry.register(
            "jobs",
            "Pool jobs by kind and outcome",
            self.jobs_total.clone(),
        );
        sub_registry.register(
            "queue_dropped",
            "Jobs rejected because the queue was full",
            self.queue_dropped_total.clone(),
        );
    }

    pub fn observe_job(&self, kind: &str, outcome: JobOutcome, seconds: f64) {
        self.job_duration_seconds
            .get_or_create(&JobLabels {
                kind: kind.to_string(),
            })
            .observe(seconds);
        self.jobs_total
            .get_or_create(&OutcomeLabels {
                kind: kind.to_string(),
                outcome,
            })
            .inc();
    }

    pub fn jobs_with_outcome(&self, kind: &str, outcome: JobOutcome) -> u64 {
        self.jobs_total
            .get_or_create(&OutcomeLabels {
                kind: kind.to_string(),
                outcome,
            })
            .get()
    }
}
