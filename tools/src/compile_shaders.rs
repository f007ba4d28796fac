use std::{
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use log::error;
use shader_build_utils::{default_pipeline, Manifest, RunReport, ShaderCompiler};

/// Compiles the renderer's GLSL shaders to SPIR-V.
#[derive(Parser, Debug)]
#[command(version, about)]
struct CompileShadersArgs {
    /// Maximum number of compiler processes running at once
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Do not start new jobs once one has failed
    #[arg(long)]
    stop_on_failure: bool,

    /// Extra attempts for a failing job
    #[arg(long)]
    retries: Option<u32>,

    /// Kill a compiler process running longer than this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Shader compiler executable
    #[arg(long)]
    compiler: Option<PathBuf>,

    /// Directory the compiler runs in
    #[arg(short = 'C', long)]
    directory: Option<PathBuf>,

    /// TOML manifest listing the shaders to compile
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Skip shaders whose .spv output is newer than the source
    #[arg(long)]
    incremental: bool,
}

fn build_compiler(args: &CompileShadersArgs) -> anyhow::Result<ShaderCompiler> {
    let compiler = match &args.manifest {
        Some(path) => {
            let manifest = Manifest::load(path)?;
            ShaderCompiler::from_manifest(&manifest)
                .context(format!("Invalid shader entry in {:?}", path))?
        }
        None => ShaderCompiler::new().add_jobs(default_pipeline()),
    };

    let mut compiler_options = compiler.get_compiler_options().clone();
    if let Some(path) = &args.compiler {
        compiler_options.compiler = path.clone();
    }
    if let Some(dir) = &args.directory {
        compiler_options.working_dir = Some(dir.clone());
    }
    if let Some(secs) = args.timeout {
        compiler_options.timeout = Some(Duration::from_secs(secs));
    }
    if args.incremental {
        compiler_options.skip_up_to_date = true;
    }

    let mut scheduler_options = *compiler.get_scheduler_options();
    if let Some(jobs) = args.jobs {
        scheduler_options.max_concurrency = jobs;
    }
    if args.stop_on_failure {
        scheduler_options.stop_on_first_failure = true;
    }
    if let Some(retries) = args.retries {
        scheduler_options.retries = retries;
    }

    Ok(compiler
        .compiler_options(compiler_options)
        .scheduler_options(scheduler_options))
}

/// Writes the compiler output of every job to `out`/`err`, then each failure
/// with its captured stderr and a final summary line.
fn write_report(
    report: &RunReport,
    out: &mut impl Write,
    err: &mut impl Write,
) -> io::Result<()> {
    for result in report.results() {
        out.write_all(result.stdout.as_bytes())?;
        if result.success {
            err.write_all(result.stderr.as_bytes())?;
        }
    }

    for result in report.failed() {
        let Some(failure) = &result.failure else {
            continue;
        };
        writeln!(err, "FAILED {}: {}", result.job, failure)?;
        let stderr = result.stderr.trim_end();
        if !stderr.is_empty() {
            writeln!(err, "{stderr}")?;
        }
    }

    writeln!(
        out,
        "{} of {} shaders compiled",
        report.succeeded().count(),
        report.total()
    )
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CompileShadersArgs::parse();
    let report = build_compiler(&args)?.compile();
    write_report(&report, &mut io::stdout().lock(), &mut io::stderr().lock())
        .context("Could not print the shader report")?;
    if !report.is_success() {
        error!("{} shader jobs failed", report.failed().count());
    }

    std::process::exit(report.exit_code());
}
