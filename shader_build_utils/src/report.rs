use std::{collections::BTreeMap, time::Duration};

use thiserror::Error;

use crate::job::{Job, JobId};

/// Exit code recorded when the compiler did not report one: it could not be
/// launched, was killed, or never ran.
pub const SENTINEL_EXIT_CODE: i32 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    #[error("Could not launch the shader compiler: {0}")]
    Launch(String),

    #[error("The shader compiler exited with code {exit_code}")]
    Compile { exit_code: i32 },

    #[error("The shader compiler did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Cancelled after an earlier job failed")]
    Cancelled,

    #[error("The job runner panicked: {0}")]
    Panicked(String),
}

#[derive(Clone, Debug)]
pub struct JobResult {
    pub id: JobId,
    pub job: Job,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub failure: Option<JobFailure>,
    pub attempts: u32,
    /// The compiler was not launched because the output was already fresh.
    pub up_to_date: bool,
}

impl JobResult {
    pub fn completed(id: JobId, job: Job, exit_code: i32, stdout: String, stderr: String) -> Self {
        let success = exit_code == 0;
        Self {
            id,
            job,
            exit_code,
            stdout,
            stderr,
            success,
            failure: (!success).then_some(JobFailure::Compile { exit_code }),
            attempts: 1,
            up_to_date: false,
        }
    }

    pub fn failed(
        id: JobId,
        job: Job,
        failure: JobFailure,
        stdout: String,
        stderr: String,
    ) -> Self {
        Self {
            id,
            job,
            exit_code: SENTINEL_EXIT_CODE,
            stdout,
            stderr,
            success: false,
            failure: Some(failure),
            attempts: 1,
            up_to_date: false,
        }
    }

    pub fn launch_error(id: JobId, job: Job, error: &std::io::Error) -> Self {
        let message = error.to_string();
        Self::failed(
            id,
            job,
            JobFailure::Launch(message.clone()),
            String::new(),
            message,
        )
    }

    pub fn cancelled(id: JobId, job: Job) -> Self {
        let mut result = Self::failed(id, job, JobFailure::Cancelled, String::new(), String::new());
        result.attempts = 0;
        result
    }

    pub fn up_to_date(id: JobId, job: Job) -> Self {
        Self {
            id,
            job,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            success: true,
            failure: None,
            attempts: 0,
            up_to_date: true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(JobFailure::Cancelled))
    }
}

/// Outcome of a whole run, keyed by job identity rather than completion order.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    results: BTreeMap<JobId, JobResult>,
}

impl RunReport {
    pub fn summarize(results: impl IntoIterator<Item = JobResult>) -> Self {
        Self {
            results: results.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn get(&self, id: JobId) -> Option<&JobResult> {
        self.results.get(&id)
    }

    /// Every result, in submission order.
    pub fn results(&self) -> impl Iterator<Item = &JobResult> {
        self.results.values()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &JobResult> {
        self.results().filter(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobResult> {
        self.results().filter(|r| !r.success)
    }

    pub fn is_success(&self) -> bool {
        self.results().all(|r| r.success)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{JobFailure, JobResult, RunReport, SENTINEL_EXIT_CODE};
    use crate::job::{Job, JobId};

    fn job(output: &str) -> Job {
        Job::new("a.frag", output, Vec::<String>::new()).unwrap()
    }

    #[test]
    fn results_are_keyed_by_job_id() {
        let report = RunReport::summarize([
            JobResult::completed(JobId(2), job("c"), 0, String::new(), String::new()),
            JobResult::completed(JobId(0), job("a"), 1, String::new(), "error".into()),
            JobResult::completed(JobId(1), job("b"), 0, String::new(), String::new()),
        ]);

        let order = report.results().map(|r| r.id.0).collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(report.get(JobId(0)).unwrap().stderr, "error");
        assert_eq!(report.succeeded().count() + report.failed().count(), 3);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn success_follows_exit_code() {
        let ok = JobResult::completed(JobId(0), job("a"), 0, String::new(), String::new());
        assert!(ok.success);
        assert_eq!(ok.failure, None);

        let bad = JobResult::completed(JobId(0), job("a"), 2, String::new(), String::new());
        assert!(!bad.success);
        assert_eq!(bad.failure, Some(JobFailure::Compile { exit_code: 2 }));
    }

    #[test]
    fn sentinel_failures() {
        let error = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let launch = JobResult::launch_error(JobId(0), job("a"), &error);
        assert_eq!(launch.exit_code, SENTINEL_EXIT_CODE);
        assert!(launch.stderr.contains("no such file"));
        assert!(matches!(launch.failure, Some(JobFailure::Launch(_))));

        let timeout = JobResult::failed(
            JobId(1),
            job("b"),
            JobFailure::Timeout(Duration::from_secs(1)),
            String::new(),
            String::new(),
        );
        assert!(!timeout.success);

        let cancelled = JobResult::cancelled(JobId(2), job("c"));
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.attempts, 0);
    }

    #[test]
    fn empty_and_all_green_reports_exit_zero() {
        assert_eq!(RunReport::default().exit_code(), 0);

        let report = RunReport::summarize([
            JobResult::completed(JobId(0), job("a"), 0, String::new(), String::new()),
            JobResult::up_to_date(JobId(1), job("b")),
        ]);
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
    }
}
