use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

pub const STDERR_EXCERPT_CHARS: usize = 500;
const EMPTY_STDERR_MESSAGE: &str = "yt-dlp no pudo completar la operacion";

/// Result of one bounded invocation of the external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded {
        stdout: Vec<u8>,
    },
    Failed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },
    TimedOut {
        budget: Duration,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("external tool {0} is not installed")]
    NotInstalled(String),
    #[error("could not run external tool: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes the external media tool. Implementations must enforce the budget
/// themselves and never return `Succeeded` for a run that exceeded it.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String], budget: Duration) -> Result<JobOutcome, RunnerError>;
}

/// Runs a real executable as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, args: &[String], budget: Duration) -> Result<JobOutcome, RunnerError> {
        debug!("Ejecutando {:?} con {} argumento(s)", self.program, args.len());

        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout also reaches ffmpeg and other helpers.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    RunnerError::NotInstalled(self.program.display().to_string())
                } else {
                    RunnerError::Io(error)
                }
            })?;

        let mut stdout_reader = spawn_pipe_reader(child.stdout.take());
        let mut stderr_reader = spawn_pipe_reader(child.stderr.take());

        let collected = timeout(budget, async {
            let status = child.wait().await?;
            let stdout = (&mut stdout_reader).await.unwrap_or_default();
            let stderr = (&mut stderr_reader).await.unwrap_or_default();
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match collected {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "{:?} excedio el presupuesto de {}s, terminando proceso",
                    self.program,
                    budget.as_secs_f32()
                );
                kill_process_group(&child);
                if let Err(error) = child.kill().await {
                    warn!("No se pudo terminar el proceso: {error}");
                }
                stdout_reader.abort();
                stderr_reader.abort();
                return Ok(JobOutcome::TimedOut { budget });
            }
        };

        if status.success() {
            Ok(JobOutcome::Succeeded { stdout })
        } else {
            Ok(JobOutcome::Failed {
                exit_code: status.code(),
                stderr_excerpt: stderr_excerpt(&stderr),
            })
        }
    }
}

/// Sends SIGKILL to every process in the child's group. The child itself is
/// still reaped by the caller.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pgid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };

    // SAFETY: the group was created for this child by `process_group(0)` and
    // the child has not been reaped yet, so the id cannot have been reused.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::ESRCH) {
            warn!("No se pudo terminar el grupo de procesos {pgid}: {error}");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe
            && let Err(error) = pipe.read_to_end(&mut buffer).await
        {
            debug!("Lectura de salida interrumpida: {error}");
        }
        buffer
    })
}

/// Non-empty stderr lines, keeping the tail when longer than
/// [`STDERR_EXCERPT_CHARS`]. The tool prints its final error last.
pub fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let joined = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if joined.is_empty() {
        return EMPTY_STDERR_MESSAGE.to_string();
    }

    let total = joined.chars().count();
    if total <= STDERR_EXCERPT_CHARS {
        joined
    } else {
        joined.chars().skip(total - STDERR_EXCERPT_CHARS).collect()
    }
}

/// Last non-empty stdout line, which is where `--print after_move:filepath`
/// leaves the final path.
pub fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}
