mod job;
mod manifest;
mod report;
mod runner;
mod scheduler;

use std::path::Path;

pub use job::{default_pipeline, Job, JobError, JobId, SPIRV_EXTENSION};
pub use manifest::{Manifest, ShaderEntry};
pub use report::{JobFailure, JobResult, RunReport, SENTINEL_EXIT_CODE};
pub use runner::{
    CompilerOptions, JobRunner, ProcessRunner, DEFAULT_CLIENT, DEFAULT_COMPILER,
    DEFAULT_TARGET_ENV,
};
pub use scheduler::{Scheduler, SchedulerOptions};

/// Compiles a list of shaders with the external compiler, e.g.
///
/// ```no_run
/// use shader_build_utils::{default_pipeline, SchedulerOptions, ShaderCompiler};
///
/// let report = ShaderCompiler::new()
///     .add_jobs(default_pipeline())
///     .scheduler_options(SchedulerOptions::default().max_concurrency(4))
///     .compile();
/// std::process::exit(report.exit_code());
/// ```
#[derive(Default)]
pub struct ShaderCompiler {
    jobs: Vec<Job>,
    compiler_options: CompilerOptions,
    scheduler_options: SchedulerOptions,
}

impl ShaderCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the job list and every option set in `manifest`. A manifest
    /// without `[[shader]]` entries builds the default pipeline.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, JobError> {
        let jobs = if manifest.shaders.is_empty() {
            default_pipeline()
        } else {
            manifest.jobs()?
        };

        Ok(Self {
            jobs,
            compiler_options: manifest.apply_to_compiler_options(CompilerOptions::default()),
            scheduler_options: manifest.apply_to_scheduler_options(SchedulerOptions::default()),
        })
    }

    pub fn add_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn add_jobs(mut self, jobs: impl IntoIterator<Item = Job>) -> Self {
        self.jobs.extend(jobs);
        self
    }

    pub fn compiler_options(mut self, options: CompilerOptions) -> Self {
        self.compiler_options = options;
        self
    }

    pub fn scheduler_options(mut self, options: SchedulerOptions) -> Self {
        self.scheduler_options = options;
        self
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.compiler_options.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get_compiler_options(&self) -> &CompilerOptions {
        &self.compiler_options
    }

    pub fn get_scheduler_options(&self) -> &SchedulerOptions {
        &self.scheduler_options
    }

    pub fn compile(self) -> RunReport {
        let runner = ProcessRunner::new(self.compiler_options);
        Scheduler::new(self.scheduler_options).run_all(self.jobs, &runner)
    }
}

#[cfg(test)]
mod tests {
    use super::{CompilerOptions, Job, Manifest, SchedulerOptions, ShaderCompiler};

    #[test]
    fn manifest_without_shaders_uses_default_pipeline() {
        let manifest = Manifest::parse("jobs = 1").unwrap();
        let compiler = ShaderCompiler::from_manifest(&manifest).unwrap();
        assert_eq!(compiler.jobs().len(), 9);
        assert_eq!(compiler.get_scheduler_options().max_concurrency, 1);
    }

    #[test]
    fn every_job_gets_a_result_when_the_compiler_is_missing() {
        let report = ShaderCompiler::new()
            .add_job(Job::new("a.frag", "opaque.frag", ["-DOPAQUE"]).unwrap())
            .add_job(Job::new("a.frag", "translucent.frag", Vec::<String>::new()).unwrap())
            .compiler_options(CompilerOptions::default().compiler("no-such-shader-compiler"))
            .scheduler_options(SchedulerOptions::default().max_concurrency(2))
            .compile();

        assert_eq!(report.total(), 2);
        assert_eq!(report.failed().count(), 2);
        assert_eq!(report.exit_code(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn compiles_with_a_real_process() {
        let dir = crate::job::tests::scratch_dir("facade");
        // Writes the file named by the last argument, like the real compiler.
        std::fs::write(
            dir.join("a.frag"),
            "for last; do :; done\nprintf 'spirv' > \"$last\"\n",
        )
        .unwrap();

        let report = ShaderCompiler::new()
            .add_job(Job::new("a.frag", "opaque.frag", ["-DOPAQUE"]).unwrap())
            .add_job(Job::new("a.frag", "translucent.frag", Vec::<String>::new()).unwrap())
            .compiler_options(CompilerOptions::default().compiler("/bin/sh"))
            .working_dir(&dir)
            .compile();

        assert_eq!(report.succeeded().count(), 2, "{report:?}");
        assert_eq!(report.exit_code(), 0);
        assert!(dir.join("opaque.frag.spv").exists());
        assert!(dir.join("translucent.frag.spv").exists());

        let _ = std::fs::remove_dir_all(dir);
    }
}
