use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
};

use crossbeam::channel::unbounded;
use log::{error, info, warn};

use crate::{
    job::{Job, JobId},
    report::{JobFailure, JobResult, RunReport},
    runner::JobRunner,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Upper bound on jobs running at the same time, clamped to at least 1.
    pub max_concurrency: usize,
    pub stop_on_first_failure: bool,
    /// Extra attempts granted to a failing job.
    pub retries: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            stop_on_first_failure: false,
            retries: 0,
        }
    }
}

impl SchedulerOptions {
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Runs jobs on a fixed pool of worker threads. Jobs are handed out in
/// submission order; the calling thread blocks until every job has a result.
#[derive(Clone, Debug, Default)]
pub struct Scheduler {
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn run_all(&self, jobs: Vec<Job>, runner: &dyn JobRunner) -> RunReport {
        let total = jobs.len();
        if total == 0 {
            return RunReport::default();
        }
        let workers = self.options.max_concurrency.clamp(1, total);
        info!("Running {total} shader jobs on {workers} workers");

        let (job_sender, job_receiver) = unbounded();
        for (index, job) in jobs.into_iter().enumerate() {
            // The receiver is alive, sending cannot fail.
            let _ = job_sender.send((JobId(index), job));
        }
        drop(job_sender);

        let (result_sender, result_receiver) = unbounded();
        let cancelled = AtomicBool::new(false);

        let results = std::thread::scope(|s| {
            for _ in 0..workers {
                let job_receiver = job_receiver.clone();
                let result_sender = result_sender.clone();
                let cancelled = &cancelled;
                s.spawn(move || {
                    for (id, job) in job_receiver.iter() {
                        let result = if cancelled.load(Ordering::Acquire) {
                            JobResult::cancelled(id, job)
                        } else {
                            let result = catch_unwind(AssertUnwindSafe(|| {
                                self.run_with_retries(id, &job, runner)
                            }))
                            .unwrap_or_else(|payload| {
                                let message = panic_message(payload.as_ref());
                                error!("Runner panicked on {job}: {message}");
                                JobResult::failed(
                                    id,
                                    job.clone(),
                                    JobFailure::Panicked(message),
                                    String::new(),
                                    String::new(),
                                )
                            });
                            if !result.success && self.options.stop_on_first_failure {
                                cancelled.store(true, Ordering::Release);
                            }
                            result
                        };
                        if result_sender.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_sender);

            let mut results = Vec::with_capacity(total);
            for result in result_receiver.iter() {
                log_completion(&result, results.len() + 1, total);
                results.push(result);
            }
            results
        });

        let report = RunReport::summarize(results);
        info!(
            "{} succeeded, {} failed",
            report.succeeded().count(),
            report.failed().count()
        );
        report
    }

    fn run_with_retries(&self, id: JobId, job: &Job, runner: &dyn JobRunner) -> JobResult {
        let mut attempt = 1;
        loop {
            let mut result = runner.run(id, job);
            result.attempts = if result.up_to_date { 0 } else { attempt };
            if result.success || result.is_cancelled() || attempt > self.options.retries {
                return result;
            }
            warn!(
                "{job} failed (attempt {attempt} of {}), retrying",
                self.options.retries + 1
            );
            attempt += 1;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn log_completion(result: &JobResult, done: usize, total: usize) {
    let job = &result.job;
    match &result.failure {
        None if result.up_to_date => info!("[{done}/{total}] {job} up to date"),
        None => info!("[{done}/{total}] {job} compiled"),
        Some(failure) if result.is_cancelled() => warn!("[{done}/{total}] {job}: {failure}"),
        Some(failure) => error!("[{done}/{total}] {job}: {failure}"),
    }
}
