use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::{
    job::{Job, JobError},
    runner::CompilerOptions,
    scheduler::SchedulerOptions,
};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ShaderEntry {
    pub source: PathBuf,
    #[serde(default)]
    pub output: PathBuf,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// A TOML description of the shaders to build and how to build them.
/// Every run option is optional; unset values keep their defaults.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub compiler: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub target_env: Option<String>,
    pub client: Option<String>,
    pub jobs: Option<usize>,
    pub stop_on_failure: Option<bool>,
    pub retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub skip_up_to_date: Option<bool>,

    #[serde(default, rename = "shader")]
    pub shaders: Vec<ShaderEntry>,
}

impl Manifest {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Could not parse shader manifest")
    }

    /// Loads a manifest; a relative `working_dir` is resolved against the
    /// manifest's own directory.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Could not read shader manifest {:?}", path))?;
        let mut manifest =
            Self::parse(&content).context(format!("In shader manifest {:?}", path))?;

        let base_dir = path.parent().unwrap_or(Path::new(""));
        manifest.working_dir = match manifest.working_dir {
            Some(dir) => Some(base_dir.join(dir)),
            None if base_dir.as_os_str().is_empty() => None,
            None => Some(base_dir.to_path_buf()),
        };
        Ok(manifest)
    }

    pub fn jobs(&self) -> Result<Vec<Job>, JobError> {
        self.shaders
            .iter()
            .map(|entry| Job::new(&entry.source, &entry.output, entry.flags.iter().cloned()))
            .collect()
    }

    pub fn apply_to_compiler_options(&self, mut options: CompilerOptions) -> CompilerOptions {
        if let Some(compiler) = &self.compiler {
            options.compiler = compiler.clone();
        }
        if let Some(dir) = &self.working_dir {
            options.working_dir = Some(dir.clone());
        }
        if let Some(target_env) = &self.target_env {
            options.target_env = target_env.clone();
        }
        if let Some(client) = &self.client {
            options.client = client.clone();
        }
        if let Some(secs) = self.timeout_secs {
            options.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(skip) = self.skip_up_to_date {
            options.skip_up_to_date = skip;
        }
        options
    }

    pub fn apply_to_scheduler_options(&self, mut options: SchedulerOptions) -> SchedulerOptions {
        if let Some(jobs) = self.jobs {
            options.max_concurrency = jobs;
        }
        if let Some(stop) = self.stop_on_failure {
            options.stop_on_first_failure = stop;
        }
        if let Some(retries) = self.retries {
            options.retries = retries;
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use super::Manifest;
    use crate::{
        job::{tests::scratch_dir, Job, JobError},
        runner::CompilerOptions,
        scheduler::SchedulerOptions,
    };

    const MANIFEST: &str = r#"
compiler = "glslc"
jobs = 2
retries = 1
timeout_secs = 30

[[shader]]
source = "rasterization.frag"
output = "opaque.frag"
flags = ["-DOPAQUE"]

[[shader]]
source = "render.vert"
"#;

    #[test]
    fn parses_jobs_and_options() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let jobs = manifest.jobs().unwrap();
        assert_eq!(
            jobs,
            vec![
                Job::new("rasterization.frag", "opaque.frag", ["-DOPAQUE"]).unwrap(),
                Job::new("render.vert", "render.vert", Vec::<String>::new()).unwrap(),
            ]
        );

        let compiler = manifest.apply_to_compiler_options(CompilerOptions::default());
        assert_eq!(compiler.compiler, PathBuf::from("glslc"));
        assert_eq!(compiler.target_env, "spirv1.5");
        assert_eq!(compiler.timeout, Some(Duration::from_secs(30)));

        let scheduler = manifest.apply_to_scheduler_options(SchedulerOptions::default());
        assert_eq!(scheduler.max_concurrency, 2);
        assert_eq!(scheduler.retries, 1);
        assert!(!scheduler.stop_on_first_failure);
    }

    #[test]
    fn bundled_manifest_matches_default_pipeline() {
        let manifest = Manifest::parse(include_str!("../shaders.toml")).unwrap();
        assert_eq!(manifest.jobs().unwrap(), crate::default_pipeline());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Manifest::parse("paralellism = 4").is_err());
        assert!(Manifest::parse("[[shader]]\nsource = \"a.frag\"\ndefine = \"X\"").is_err());
    }

    #[test]
    fn empty_source_is_reported() {
        let manifest = Manifest::parse("[[shader]]\nsource = \"\"").unwrap();
        assert_eq!(manifest.jobs(), Err(JobError::EmptySourcePath));
    }

    #[test]
    fn working_dir_is_relative_to_the_manifest() {
        let dir = scratch_dir("manifest");
        let path = dir.join("shaders.toml");
        std::fs::write(&path, "working_dir = \"src\"\n[[shader]]\nsource = \"a.comp\"").unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.working_dir, Some(dir.join("src")));
        assert!(Manifest::load(dir.join("missing.toml")).is_err());

        let _ = std::fs::remove_dir_all(dir);
    }
}
