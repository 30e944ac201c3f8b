use std::sync::Arc;

use uuid::Uuid;

use crate::policy::is_denied_package;
use crate::protocol::QueueSnapshot;
use crate::protocol::RunJob;
use crate::protocol::RunMode;
use crate::rate_limit::FixedWindowRateLimiter;
use crate::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    RateLimited,
    Overloaded,
    DeniedPackage,
}

#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub status: SubmitStatus,
    pub run_id: Option<String>,
}

/// Request fields that survive admission and become a `RunJob`.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub package_name: String,
    pub version: String,
    pub mode: RunMode,
    pub file_path: Option<String>,
    pub entrypoint: Option<String>,
    pub module_name: Option<String>,
}

/// Admission control. Denylist and rate limit are evaluated before a run id
/// is minted; `Accepted` is the only outcome that carries one.
pub struct SubmissionService {
    rate_limiter: FixedWindowRateLimiter,
    worker_pool: Arc<WorkerPool>,
    package_denylist: Vec<String>,
}

impl SubmissionService {
    pub fn new(
        rate_limiter: FixedWindowRateLimiter,
        worker_pool: Arc<WorkerPool>,
        package_denylist: Vec<String>,
    ) -> Self {
        Self {
            rate_limiter,
            worker_pool,
            package_denylist,
        }
    }

    pub fn submit(&self, params: SubmitParams, client_ip: &str) -> SubmitResult {
        if is_denied_package(&params.package_name, &self.package_denylist) {
            return SubmitResult {
                status: SubmitStatus::DeniedPackage,
                run_id: None,
            };
        }

        if !self.rate_limiter.allow(client_ip) {
            return SubmitResult {
                status: SubmitStatus::RateLimited,
                run_id: None,
            };
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let job = RunJob {
            run_id: run_id.clone(),
            package_name: params.package_name,
            version: params.version,
            mode: params.mode,
            file_path: params.file_path,
            entrypoint: params.entrypoint,
            module_name: params.module_name,
        };
        if !self.worker_pool.submit(job) {
            tracing::warn!("queue full; rejected run from ip={client_ip}");
            return SubmitResult {
                status: SubmitStatus::Overloaded,
                run_id: None,
            };
        }
        SubmitResult {
            status: SubmitStatus::Accepted,
            run_id: Some(run_id),
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.worker_pool.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::protocol::JobHandler;

    #[derive(Default)]
    struct RecordingHandler {
        jobs: Mutex<Vec<RunJob>>,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: RunJob) {
            self.jobs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(job);
        }
    }

    fn limiter(limit: u32) -> FixedWindowRateLimiter {
        FixedWindowRateLimiter::new(limit, Duration::from_secs(60))
    }

    fn params(package_name: &str) -> SubmitParams {
        SubmitParams {
            package_name: package_name.to_string(),
            version: "1.0".to_string(),
            mode: RunMode::Install,
            file_path: None,
            entrypoint: None,
            module_name: None,
        }
    }

    async fn started_pool(handler: Arc<RecordingHandler>) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool::new(1, 8, handler));
        pool.start().await;
        pool
    }

    #[tokio::test]
    async fn denylisted_package_never_mints_a_run_id() {
        let handler = Arc::new(RecordingHandler::default());
        let pool = started_pool(handler.clone()).await;
        let svc = SubmissionService::new(limiter(5), pool.clone(), vec!["torch".to_string()]);

        let result = svc.submit(params("Torch_CPU"), "1.2.3.4");
        assert_eq!(result.status, SubmitStatus::DeniedPackage);
        assert!(result.run_id.is_none());

        pool.wait_idle().await;
        pool.stop().await;
        assert!(handler.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_path_short_circuits_before_queueing() {
        let handler = Arc::new(RecordingHandler::default());
        let pool = started_pool(handler.clone()).await;
        let svc = SubmissionService::new(limiter(1), pool.clone(), Vec::new());

        assert_eq!(
            svc.submit(params("requests"), "1.2.3.4").status,
            SubmitStatus::Accepted
        );
        let second = svc.submit(params("requests"), "1.2.3.4");
        assert_eq!(second.status, SubmitStatus::RateLimited);
        assert!(second.run_id.is_none());

        pool.wait_idle().await;
        pool.stop().await;
        assert_eq!(handler.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn accepted_job_carries_mode_and_run_targets() {
        let handler = Arc::new(RecordingHandler::default());
        let pool = started_pool(handler.clone()).await;
        let svc = SubmissionService::new(limiter(5), pool.clone(), Vec::new());

        let result = svc.submit(
            SubmitParams {
                package_name: "requests".to_string(),
                version: "1.0".to_string(),
                mode: RunMode::ExecuteModule,
                file_path: Some("/tmp/runner.py".to_string()),
                entrypoint: Some("requests.cli:main".to_string()),
                module_name: Some("requests".to_string()),
            },
            "1.2.3.4",
        );
        assert_eq!(result.status, SubmitStatus::Accepted);
        let run_id = result.run_id.clone().unwrap();
        assert_eq!(run_id.len(), 32);

        pool.wait_idle().await;
        pool.stop().await;
        let jobs = handler.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].run_id, run_id);
        assert_eq!(jobs[0].mode, RunMode::ExecuteModule);
        assert_eq!(jobs[0].file_path.as_deref(), Some("/tmp/runner.py"));
        assert_eq!(jobs[0].entrypoint.as_deref(), Some("requests.cli:main"));
        assert_eq!(jobs[0].module_name.as_deref(), Some("requests"));
    }

    #[tokio::test]
    async fn full_pool_reports_overloaded() {
        let handler = Arc::new(RecordingHandler::default());
        // Not started: every submit is rejected, which admission reports as
        // overload.
        let pool = Arc::new(WorkerPool::new(1, 1, handler));
        let svc = SubmissionService::new(limiter(5), pool, Vec::new());

        let result = svc.submit(params("requests"), "1.2.3.4");
        assert_eq!(result.status, SubmitStatus::Overloaded);
        assert!(result.run_id.is_none());
    }
}
