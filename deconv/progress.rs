use std::fmt;

/// Stages reported while processing a batch of query samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchProgressStage {
    Deconvolution,
}

impl BatchProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Deconvolution => "sample deconvolution",
        }
    }
}

impl fmt::Display for BatchProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress during a batch run.
///
/// Samples are processed in parallel, so callbacks take `&self` and may be
/// invoked from several threads at once.
pub trait BatchProgressObserver: Sync {
    fn on_stage_start(&self, stage: BatchProgressStage, total_samples: usize) {
        let _ = (stage, total_samples);
    }
    fn on_sample_done(&self, stage: BatchProgressStage, sample: &str, succeeded: bool) {
        let _ = (stage, sample, succeeded);
    }
    fn on_stage_finish(&self, stage: BatchProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopBatchProgress;

impl BatchProgressObserver for NoopBatchProgress {}
