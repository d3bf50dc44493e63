use std::io::BufRead;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Cooperative cancellation handle. Registered per job while it runs and
/// fired by pause, cancel and shutdown; firing is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Which pipe a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One external process launch: program, ordered args, optional working
/// directory and environment overrides.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ExecSpec {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
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

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        // Children get their own process group so a cancel can tear down the
        // whole tree, including anything the tool forked.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }
        // No console window may pop up when a tool spawns from a desktop
        // process. No-op elsewhere.
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }

    /// Quoted command line for job logs.
    pub fn display_command(&self) -> String {
        let mut out = format!("{}", self.program.display());
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('"') {
                out.push_str(&format!(" \"{}\"", arg.replace('"', "\\\"")));
            } else {
                out.push(' ');
                out.push_str(arg);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Window between the graceful stop signal and the process-tree kill.
    pub stop_grace: Duration,
    /// Optional hard wall-clock deadline for the whole run.
    pub deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(3),
            deadline: None,
        }
    }
}

/// Outcome of a completed run. A non-zero exit code is a valid result, not a
/// supervisor error.
#[derive(Debug, Clone, Copy)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub wall_clock: Duration,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to launch {}: {message}", program.display())]
    Launch { program: PathBuf, message: String },
    #[error("process did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("run cancelled")]
    Cancelled,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Line pump: one reader thread per pipe feeding a shared channel, so output
/// is streamed without unbounded buffering. Partial trailing lines are
/// delivered on EOF; invalid UTF-8 is replaced rather than dropped.
struct LinePump {
    rx: Option<mpsc::Receiver<(StreamKind, String)>>,
    joins: Vec<std::thread::JoinHandle<()>>,
}

impl LinePump {
    fn new() -> (Self, mpsc::Sender<(StreamKind, String)>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                rx: Some(rx),
                joins: Vec::new(),
            },
            tx,
        )
    }

    fn attach<R: std::io::Read + Send + 'static>(
        &mut self,
        kind: StreamKind,
        reader: R,
        tx: mpsc::Sender<(StreamKind, String)>,
    ) {
        let join = std::thread::spawn(move || {
            let mut reader = std::io::BufReader::new(reader);
            let mut buf: Vec<u8> = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                            buf.pop();
                        }
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        if tx.send((kind, line)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        self.joins.push(join);
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Option<(StreamKind, String)> {
        let Some(rx) = self.rx.as_ref() else {
            std::thread::sleep(timeout);
            return None;
        };
        match rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.rx = None;
                None
            }
        }
    }

    fn drain(&mut self, mut on_line: impl FnMut(StreamKind, &str)) {
        // All writers are gone once the children exited; join the readers
        // first so every buffered line is in the channel, then empty it.
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        if let Some(rx) = self.rx.take() {
            while let Ok((kind, line)) = rx.try_recv() {
                on_line(kind, &line);
            }
        }
    }
}

fn spawn(spec: &ExecSpec, stdin: Stdio, stdout: Stdio) -> Result<Child, RunError> {
    spec.command()
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                RunError::NotFound(spec.program.clone())
            } else {
                RunError::Launch {
                    program: spec.program.clone(),
                    message: err.to_string(),
                }
            }
        })
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pgid, signal);
    }
}

/// Graceful stop, grace window, then kill the whole process tree. Safe to
/// call for already-exited children.
fn terminate_tree(children: &mut [&mut Child], grace: Duration) {
    #[cfg(unix)]
    {
        for child in children.iter() {
            signal_group(child, libc::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        loop {
            let all_dead = children
                .iter_mut()
                .all(|child| matches!(child.try_wait(), Ok(Some(_))));
            if all_dead {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        for child in children.iter_mut() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                warn!(pid = child.id(), "graceful stop expired; killing process tree");
                signal_group(child, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        for child in children.iter_mut() {
            let _ = child.kill();
        }
    }
    for child in children.iter_mut() {
        let _ = child.wait();
    }
}

/// Run one external process to completion, streaming its output line by
/// line. On cancellation the process tree is stopped gracefully, then
/// killed after the grace window.
pub fn run(
    spec: &ExecSpec,
    opts: RunOptions,
    on_line: &mut dyn FnMut(StreamKind, &str),
    cancel: &CancelToken,
) -> Result<ExitReport, RunError> {
    let start = Instant::now();
    let mut child = spawn(spec, Stdio::null(), Stdio::piped())?;
    debug!(program = %spec.program.display(), pid = child.id(), "spawned stage process");

    let (mut pump, tx) = LinePump::new();
    if let Some(stdout) = child.stdout.take() {
        pump.attach(StreamKind::Stdout, stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump.attach(StreamKind::Stderr, stderr, tx);
    }

    supervise(&mut [&mut child], &mut pump, opts, on_line, cancel, start)
}

/// Run a piped pair: the producer's stdout feeds the consumer's stdin
/// directly (no copy task), both stderr streams are pumped, and
/// cancellation tears both down as a single unit.
pub fn run_piped(
    producer: &ExecSpec,
    consumer: &ExecSpec,
    opts: RunOptions,
    on_line: &mut dyn FnMut(StreamKind, &str),
    cancel: &CancelToken,
) -> Result<ExitReport, RunError> {
    let start = Instant::now();
    let mut producer_child = spawn(producer, Stdio::null(), Stdio::piped())?;
    debug!(
        program = %producer.program.display(),
        pid = producer_child.id(),
        "spawned pipe producer"
    );

    let Some(producer_stdout) = producer_child.stdout.take() else {
        terminate_tree(&mut [&mut producer_child], opts.stop_grace);
        return Err(RunError::Launch {
            program: producer.program.clone(),
            message: "producer stdout pipe unavailable".to_string(),
        });
    };

    let mut consumer_child = match spawn(consumer, Stdio::from(producer_stdout), Stdio::piped()) {
        Ok(child) => child,
        Err(err) => {
            terminate_tree(&mut [&mut producer_child], opts.stop_grace);
            return Err(err);
        }
    };
    debug!(
        program = %consumer.program.display(),
        pid = consumer_child.id(),
        "spawned pipe consumer"
    );

    let (mut pump, tx) = LinePump::new();
    if let Some(stderr) = producer_child.stderr.take() {
        pump.attach(StreamKind::Stderr, stderr, tx.clone());
    }
    if let Some(stdout) = consumer_child.stdout.take() {
        pump.attach(StreamKind::Stdout, stdout, tx.clone());
    }
    if let Some(stderr) = consumer_child.stderr.take() {
        pump.attach(StreamKind::Stderr, stderr, tx);
    }

    supervise(
        &mut [&mut producer_child, &mut consumer_child],
        &mut pump,
        opts,
        on_line,
        cancel,
        start,
    )
}

fn supervise(
    children: &mut [&mut Child],
    pump: &mut LinePump,
    opts: RunOptions,
    on_line: &mut dyn FnMut(StreamKind, &str),
    cancel: &CancelToken,
    start: Instant,
) -> Result<ExitReport, RunError> {
    let mut statuses: Vec<Option<std::process::ExitStatus>> = vec![None; children.len()];

    loop {
        if cancel.is_cancelled() {
            terminate_tree(children, opts.stop_grace);
            pump.drain(|_, _| {});
            return Err(RunError::Cancelled);
        }
        if let Some(deadline) = opts.deadline {
            if start.elapsed() >= deadline {
                terminate_tree(children, opts.stop_grace);
                pump.drain(|_, _| {});
                return Err(RunError::TimedOut(deadline));
            }
        }

        if let Some((kind, line)) = pump.recv_timeout(POLL_INTERVAL) {
            on_line(kind, &line);
        }

        let mut all_done = true;
        for (child, slot) in children.iter_mut().zip(statuses.iter_mut()) {
            if slot.is_none() {
                match child.try_wait() {
                    Ok(Some(status)) => *slot = Some(status),
                    Ok(None) => all_done = false,
                    Err(_) => all_done = false,
                }
            }
        }
        if all_done {
            break;
        }
    }

    // Deliver everything buffered up to EOF, including a partial final line.
    pump.drain(&mut *on_line);

    // For a pair, a producer failure is the interesting code even when the
    // consumer exits cleanly after its stdin closes.
    let code = statuses
        .iter()
        .flatten()
        .map(|status| status.code())
        .find(|code| *code != Some(0))
        .unwrap_or(Some(0));

    Ok(ExitReport {
        code,
        wall_clock: start.elapsed(),
    })
}
