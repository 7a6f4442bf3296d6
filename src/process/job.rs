use crate::error::CoreError;
use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

const READ_CHUNK_SIZE: usize = 4096;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// An external command to run as a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[cfg(test)]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Opaque job identity, used for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Spawned,
    Running,
    Exited,
}

/// How a job's process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobExit {
    code: Option<i32>,
    signal: Option<i32>,
    stop_requested: bool,
}

impl JobExit {
    fn from_status(status: io::Result<ExitStatus>, stop_requested: bool) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(&status),
                stop_requested,
            },
            Err(e) => {
                tracing::warn!("Failed to wait on child process: {}", e);
                Self {
                    code: None,
                    signal: None,
                    stop_requested,
                }
            }
        }
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// True when the process died from the termination signal `stop()` sent.
    ///
    /// Decided from the OS-reported termination cause, not from an exit code
    /// convention of a particular tool.
    pub fn stopped_by_caller(&self) -> bool {
        #[cfg(unix)]
        {
            self.stop_requested && self.signal() == Some(libc::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            self.stop_requested && !self.success()
        }
    }
}

impl fmt::Display for JobExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code(), self.signal()) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

type OutputFn = Box<dyn FnMut(Vec<u8>)>;
type ExitFn = Box<dyn FnOnce(JobExit)>;

/// Callbacks for one job. Output callbacks run zero or more times, always
/// before `on_exit`, which runs exactly once.
#[derive(Default)]
pub struct JobCallbacks {
    on_stdout: Option<OutputFn>,
    on_stderr: Option<OutputFn>,
    on_exit: Option<ExitFn>,
}

impl JobCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_stdout(mut self, f: impl FnMut(Vec<u8>) + 'static) -> Self {
        self.on_stdout = Some(Box::new(f));
        self
    }

    pub fn on_stderr(mut self, f: impl FnMut(Vec<u8>) + 'static) -> Self {
        self.on_stderr = Some(Box::new(f));
        self
    }

    pub fn on_exit(mut self, f: impl FnOnce(JobExit) + 'static) -> Self {
        self.on_exit = Some(Box::new(f));
        self
    }
}

struct JobShared {
    id: JobId,
    program: String,
    state: Cell<JobState>,
    exit: OnceCell<JobExit>,
    stop_requested: Cell<bool>,
    stop_tx: RefCell<Option<oneshot::Sender<()>>>,
}

/// Handle to a running job. Cheap to clone; all clones refer to the same process.
#[derive(Clone)]
pub struct JobHandle {
    shared: Rc<JobShared>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.shared.id
    }

    pub fn state(&self) -> JobState {
        self.shared.state.get()
    }

    #[cfg(test)]
    pub fn exit(&self) -> Option<JobExit> {
        self.shared.exit.get().copied()
    }

    pub fn is_running(&self) -> bool {
        self.state() != JobState::Exited
    }

    /// Ask the process to terminate.
    ///
    /// Returns `false` if the job already exited or a stop was already sent.
    /// `on_exit` still fires afterwards and reports how the process ended.
    pub fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        let Some(tx) = self.shared.stop_tx.borrow_mut().take() else {
            return false;
        };

        self.shared.stop_requested.set(true);
        tracing::debug!("{}: stop requested for {}", self.shared.id, self.shared.program);
        tx.send(()).is_ok()
    }
}

enum Output {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Spawn `cmd` and deliver its output and exit through `callbacks`.
///
/// Must be called from within a `tokio::task::LocalSet`: every callback runs
/// on that set's thread, whatever thread read the bytes. A command that cannot
/// be started is reported here and `on_exit` never fires.
pub fn spawn(cmd: &CommandSpec, callbacks: JobCallbacks) -> Result<JobHandle, CoreError> {
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| CoreError::Spawn {
        program: cmd.program.clone(),
        source,
    })?;

    let id = JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed));
    tracing::debug!("{}: spawned {} (pid {:?})", id, cmd.program, child.id());

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, output_tx.clone(), Output::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, output_tx.clone(), Output::Stderr));
    }
    // Channel closes once both pumps hit EOF
    drop(output_tx);

    let (stop_tx, stop_rx) = oneshot::channel();
    let shared = Rc::new(JobShared {
        id,
        program: cmd.program.clone(),
        state: Cell::new(JobState::Spawned),
        exit: OnceCell::new(),
        stop_requested: Cell::new(false),
        stop_tx: RefCell::new(Some(stop_tx)),
    });

    tokio::task::spawn_local(drive(
        child,
        output_rx,
        stop_rx,
        callbacks,
        Rc::clone(&shared),
    ));

    Ok(JobHandle { shared })
}

async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<Output>, wrap: fn(Vec<u8>) -> Output)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read process output: {}", e);
                break;
            }
        }
    }
}

async fn drive(
    mut child: Child,
    mut output_rx: mpsc::UnboundedReceiver<Output>,
    mut stop_rx: oneshot::Receiver<()>,
    mut callbacks: JobCallbacks,
    shared: Rc<JobShared>,
) {
    shared.state.set(JobState::Running);

    let mut output_open = true;
    let mut stop_pending = true;

    // Exit is only awaited after both pipes closed, so output always precedes it
    let status = loop {
        tokio::select! {
            output = output_rx.recv(), if output_open => match output {
                Some(Output::Stdout(bytes)) => {
                    if let Some(on_stdout) = callbacks.on_stdout.as_mut() {
                        on_stdout(bytes);
                    }
                }
                Some(Output::Stderr(bytes)) => {
                    if let Some(on_stderr) = callbacks.on_stderr.as_mut() {
                        on_stderr(bytes);
                    }
                }
                None => output_open = false,
            },

            request = &mut stop_rx, if stop_pending => {
                stop_pending = false;
                if request.is_ok() {
                    if let Err(e) = terminate(&mut child) {
                        tracing::warn!("{}: failed to signal {}: {}", shared.id, shared.program, e);
                    }
                }
            }

            status = child.wait(), if !output_open => break status,
        }
    };

    let exit = JobExit::from_status(status, shared.stop_requested.get());
    let _ = shared.exit.set(exit);
    shared.state.set(JobState::Exited);
    shared.stop_tx.borrow_mut().take();
    tracing::debug!("{}: {} finished with {}", shared.id, shared.program, exit);

    if let Some(on_exit) = callbacks.on_exit.take() {
        on_exit(exit);
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };

    // SAFETY: pid is our own child and has not been reaped yet (`id()` is None after wait)
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
