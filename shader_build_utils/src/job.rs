use std::{
    ffi::OsString,
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

pub const SPIRV_EXTENSION: &str = "spv";

/// Position of a job in the submitted sequence, used to key its result.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct JobId(pub usize);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("A shader job needs a non empty source path")]
    EmptySourcePath,
}

/// One compilation unit: a shader source compiled into `<output_path>.spv`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Job {
    source_path: PathBuf,
    output_path: PathBuf,
    flags: Vec<String>,
}

impl Job {
    /// An empty `output_path` falls back to `source_path`.
    pub fn new(
        source_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
        flags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, JobError> {
        let source_path = source_path.as_ref().to_path_buf();
        if source_path.as_os_str().is_empty() {
            return Err(JobError::EmptySourcePath);
        }

        let output_path = output_path.as_ref();
        let output_path = if output_path.as_os_str().is_empty() {
            source_path.clone()
        } else {
            output_path.to_path_buf()
        };

        Ok(Self {
            source_path,
            output_path,
            flags: flags.into_iter().map(Into::into).collect(),
        })
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    /// The file written by the compiler. The extension is appended, so
    /// `opaque.frag` becomes `opaque.frag.spv`.
    pub fn spirv_path(&self) -> PathBuf {
        let mut path = OsString::from(self.output_path.as_os_str());
        path.push(".");
        path.push(SPIRV_EXTENSION);
        PathBuf::from(path)
    }

    /// True when both files exist and the output is not older than the source.
    /// Relative paths are resolved against `base_dir`.
    pub fn is_up_to_date(&self, base_dir: Option<&Path>) -> bool {
        let resolve = |path: &Path| match base_dir {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        };
        let modified = |path: PathBuf| fs::metadata(path).and_then(|m| m.modified()).ok();

        match (
            modified(resolve(&self.source_path)),
            modified(resolve(&self.spirv_path())),
        ) {
            (Some(source), Some(output)) => output >= source,
            _ => false,
        }
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.source_path.display(),
            self.spirv_path().display()
        )?;
        if !self.flags.is_empty() {
            write!(f, " [{}]", self.flags.join(" "))?;
        }
        Ok(())
    }
}

const DEFAULT_PIPELINE: [(&str, &str, &[&str]); 9] = [
    ("rasterization.frag", "opaque.frag", &["-DOPAQUE"]),
    ("rasterization.geom", "opaque.geom", &["-DOPAQUE"]),
    ("rasterization.vert", "opaque.vert", &["-DOPAQUE"]),
    ("rasterization.frag", "translucent.frag", &[]),
    ("rasterization.geom", "translucent.geom", &[]),
    ("rasterization.vert", "translucent.vert", &[]),
    ("rayTracing.comp", "rayTracing.comp", &[]),
    ("render.frag", "render.frag", &[]),
    ("render.vert", "render.vert", &[]),
];

/// The renderer's shader set: opaque and translucent rasterization variants,
/// the ray tracing compute pass and the final render pass.
pub fn default_pipeline() -> Vec<Job> {
    DEFAULT_PIPELINE
        .iter()
        .map(|(source, output, flags)| Job {
            source_path: PathBuf::from(source),
            output_path: PathBuf::from(output),
            flags: flags.iter().map(|f| f.to_string()).collect(),
        })
        .collect()
}
