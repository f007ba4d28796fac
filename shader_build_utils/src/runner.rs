use std::{
    ffi::OsString,
    io::Read,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::{
    job::{Job, JobId},
    report::{JobFailure, JobResult, SENTINEL_EXIT_CODE},
};

pub const DEFAULT_COMPILER: &str = "glslangValidator";
pub const DEFAULT_TARGET_ENV: &str = "spirv1.5";
pub const DEFAULT_CLIENT: &str = "vulkan100";

const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long output is still collected once a timed out compiler was killed.
/// Processes it forked may keep the pipes open long after that.
const OUTPUT_GRACE_PERIOD: Duration = Duration::from_millis(250);
const READ_CHUNK_SIZE: usize = 8192;

/// Runs a single job to completion. Implementations are shared between the
/// scheduler's worker threads.
pub trait JobRunner: Sync {
    fn run(&self, id: JobId, job: &Job) -> JobResult;
}

impl<F> JobRunner for F
where
    F: Fn(JobId, &Job) -> JobResult + Sync,
{
    fn run(&self, id: JobId, job: &Job) -> JobResult {
        self(id, job)
    }
}

#[derive(Clone, Debug)]
pub struct CompilerOptions {
    pub compiler: PathBuf,
    pub target_env: String,
    pub client: String,
    /// Directory the compiler runs in; relative job paths resolve against it.
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub skip_up_to_date: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            compiler: PathBuf::from(DEFAULT_COMPILER),
            target_env: DEFAULT_TARGET_ENV.to_owned(),
            client: DEFAULT_CLIENT.to_owned(),
            working_dir: None,
            timeout: None,
            skip_up_to_date: false,
        }
    }
}

impl CompilerOptions {
    pub fn compiler(mut self, compiler: impl Into<PathBuf>) -> Self {
        self.compiler = compiler.into();
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_up_to_date(mut self, skip: bool) -> Self {
        self.skip_up_to_date = skip;
        self
    }
}

/// Invokes the external shader compiler as a child process.
#[derive(Clone, Debug, Default)]
pub struct ProcessRunner {
    options: CompilerOptions,
}

enum ChildExit {
    Exited(ExitStatus),
    TimedOut(Duration),
    WaitFailed(std::io::Error),
}

impl ProcessRunner {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// `<compiler> <source> --target-env <env> --client <client> <flags...> -o <output>.spv`
    pub fn command_line(&self, job: &Job) -> Vec<OsString> {
        let mut line = vec![
            self.options.compiler.clone().into_os_string(),
            job.source_path().as_os_str().to_owned(),
            "--target-env".into(),
            self.options.target_env.clone().into(),
            "--client".into(),
            self.options.client.clone().into(),
        ];
        line.extend(job.flags().iter().map(OsString::from));
        line.push("-o".into());
        line.push(job.spirv_path().into_os_string());
        line
    }

    fn command(&self, job: &Job) -> Command {
        let line = self.command_line(job);
        let mut command = Command::new(&line[0]);
        command
            .args(&line[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.options.working_dir {
            command.current_dir(dir);
        }
        command
    }

    fn wait(&self, child: &mut Child) -> ChildExit {
        let Some(timeout) = self.options.timeout else {
            return match child.wait() {
                Ok(status) => ChildExit::Exited(status),
                Err(e) => ChildExit::WaitFailed(e),
            };
        };

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return ChildExit::Exited(status),
                Ok(None) if started.elapsed() >= timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return ChildExit::TimedOut(timeout);
                }
                Ok(None) => std::thread::sleep(TIMEOUT_POLL_INTERVAL.min(timeout)),
                Err(e) => return ChildExit::WaitFailed(e),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Forwards a pipe to `sender` chunk by chunk until it closes. The thread is
/// detached: whoever collects the output decides how long to listen.
fn spawn_reader(
    pipe: Option<impl Read + Send + 'static>,
    stream: OutputStream,
    sender: Sender<(OutputStream, Vec<u8>)>,
) {
    let Some(mut pipe) = pipe else {
        return;
    };
    std::thread::spawn(move || {
        let mut buffer = [0u8; READ_CHUNK_SIZE];
        loop {
            match pipe.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if sender.send((stream, buffer[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Failed to read compiler output: {e}");
                    break;
                }
            }
        }
    });
}

/// Collects output until both pipes close or `deadline` passes.
fn collect_output(
    receiver: &Receiver<(OutputStream, Vec<u8>)>,
    deadline: Option<Instant>,
) -> (String, String) {
    let mut stdout = vec![];
    let mut stderr = vec![];
    loop {
        let chunk = match deadline {
            Some(deadline) => match receiver.recv_deadline(deadline) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Compiler output is still open, discarding the rest");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(chunk) => chunk,
                Err(_) => break,
            },
        };
        match chunk {
            (OutputStream::Stdout, bytes) => stdout.extend_from_slice(&bytes),
            (OutputStream::Stderr, bytes) => stderr.extend_from_slice(&bytes),
        }
    }
    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

impl JobRunner for ProcessRunner {
    fn run(&self, id: JobId, job: &Job) -> JobResult {
        if self.options.skip_up_to_date && job.is_up_to_date(self.options.working_dir.as_deref())
        {
            info!("Skipping {job}: output is up to date");
            return JobResult::up_to_date(id, job.clone());
        }

        info!("Compiling {job}");
        debug!(
            "{}",
            self.command_line(job)
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = match self.command(job).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "Could not launch {:?} for {job}: {e}",
                    self.options.compiler
                );
                return JobResult::launch_error(id, job.clone(), &e);
            }
        };

        // Both pipes are drained while waiting, otherwise a chatty compiler
        // blocks on a full pipe and never exits.
        let started = Instant::now();
        let (output_sender, output_receiver) = unbounded();
        spawn_reader(child.stdout.take(), OutputStream::Stdout, output_sender.clone());
        spawn_reader(child.stderr.take(), OutputStream::Stderr, output_sender);
        let exit = self.wait(&mut child);

        // Anything the compiler forked may hold the pipes past its exit, so a
        // job with a timeout never waits on them beyond its limit.
        let output_deadline = match (&exit, self.options.timeout) {
            (ChildExit::TimedOut(_), _) => Some(Instant::now() + OUTPUT_GRACE_PERIOD),
            (_, Some(timeout)) => {
                Some((started + timeout).max(Instant::now() + OUTPUT_GRACE_PERIOD))
            }
            (_, None) => None,
        };
        let (stdout, stderr) = collect_output(&output_receiver, output_deadline);

        match exit {
            ChildExit::Exited(status) => match status.code() {
                Some(code) => JobResult::completed(id, job.clone(), code, stdout, stderr),
                None => JobResult::failed(
                    id,
                    job.clone(),
                    JobFailure::Compile {
                        exit_code: SENTINEL_EXIT_CODE,
                    },
                    stdout,
                    stderr,
                ),
            },
            ChildExit::TimedOut(timeout) => {
                error!("{job} timed out after {timeout:?}");
                JobResult::failed(id, job.clone(), JobFailure::Timeout(timeout), stdout, stderr)
            }
            ChildExit::WaitFailed(e) => {
                error!("Lost track of the compiler for {job}: {e}");
                let mut result = JobResult::launch_error(id, job.clone(), &e);
                result.stdout = stdout;
                result.stderr = stderr + &result.stderr;
                result
            }
        }
    }
}
