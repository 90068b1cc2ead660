//! 假的管道实现

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scheduler_domain::runnable::{
    PipelineFailure, PipelineRunnable, RunContext, RunOutcome, RunParams,
};

#[derive(Debug, Default)]
struct FakeState {
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    cancelled: AtomicBool,
    params: Mutex<Vec<RunParams>>,
}

/// 可配置的假管道
///
/// - `failures`：前N次调用失败
/// - `delay`：每次运行耗时
/// - `cooperative`：为 false 时忽略取消信号
/// - `panics`：运行时panic
#[derive(Debug, Clone)]
pub struct FakeRunnable {
    records: i64,
    failures: usize,
    delay: Duration,
    cooperative: bool,
    panics: bool,
    state: Arc<FakeState>,
}

impl FakeRunnable {
    pub fn succeeding(records: i64) -> Self {
        Self {
            records,
            failures: 0,
            delay: Duration::ZERO,
            cooperative: true,
            panics: false,
            state: Arc::default(),
        }
    }

    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures,
            ..Self::succeeding(1)
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_times(usize::MAX)
    }

    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::succeeding(0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.cooperative = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// 观察到的最大并发运行数
    pub fn max_concurrency(&self) -> usize {
        self.state.max_running.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn saw_cancel(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn received_params(&self) -> Vec<RunParams> {
        self.state.params.lock().unwrap().clone()
    }
}

struct RunningGuard(Arc<FakeState>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PipelineRunnable for FakeRunnable {
    async fn run(
        &self,
        params: RunParams,
        mut ctx: RunContext,
    ) -> Result<RunOutcome, PipelineFailure> {
        let call = self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.params.lock().unwrap().push(params);
        let running = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_running.fetch_max(running, Ordering::SeqCst);
        let _guard = RunningGuard(self.state.clone());

        if self.panics {
            panic!("fake runnable panicked");
        }

        if !self.delay.is_zero() {
            if self.cooperative {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = ctx.cancelled() => {
                        self.state.cancelled.store(true, Ordering::SeqCst);
                        return Err(PipelineFailure::new("cancelled by request"));
                    }
                }
            } else {
                tokio::time::sleep(self.delay).await;
            }
        }

        ctx.report_progress(self.records);
        if call < self.failures {
            return Err(PipelineFailure::new(format!("attempt {} failed", call + 1))
                .with_traceback("fake traceback"));
        }
        Ok(RunOutcome::with_records(self.records))
    }
}
