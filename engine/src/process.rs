//! External process supervision.
//!
//! This module provides:
//! - `CommandSpec`: a description of the command a backend wants to run,
//!   including how its stdio is wired
//! - `spawn`: starts the command in its own process group
//! - `ProcessHandle`: bounded waits, escalating signals and a final reap
//!
//! Captured pipes are drained by background threads from the moment the
//! process starts, so a child never blocks on a full pipe buffer and the
//! final reap never deadlocks.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::EngineError;

/// How often a bounded wait checks the child.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured output beyond this is dropped from the front.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Where the child's stdin comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinSource {
    Null,
    Inherit,
    File(PathBuf),
}

/// Where a child's stdout or stderr goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Pass-through to the agent's own stream
    Inherit,
    Null,
    /// Piped and kept in memory for parsing
    Capture,
    /// Truncated and written to a file
    File(PathBuf),
}

/// A command a backend wants to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    stdin: StdinSource,
    stdout: OutputMode,
    stderr: OutputMode,
    scratch_files: Vec<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            stdin: StdinSource::Null,
            stdout: OutputMode::Inherit,
            stderr: OutputMode::Inherit,
            scratch_files: Vec::new(),
        }
    }

    /// Run `script` with `sh -c`.
    ///
    /// Values must be passed with `arg`/`args` and referenced as `"$1"`,
    /// `"$2"`, ... inside the script, never formatted into it.
    pub fn shell(script: impl Into<String>) -> Self {
        CommandSpec::new("sh").arg("-c").arg(script).arg("sh")
    }

    /// Run `producer | consumer` with `sh -c`, exiting with the producer's
    /// status when it failed and the consumer's otherwise.
    ///
    /// The consumer must redirect its own stdout. Positional arguments
    /// work as with `shell`.
    pub fn pipe(producer: &str, consumer: &str) -> Self {
        CommandSpec::shell(pipe_script(producer, consumer))
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

    pub fn stdin(mut self, source: StdinSource) -> Self {
        self.stdin = source;
        self
    }

    pub fn stdout(mut self, mode: OutputMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stderr(mut self, mode: OutputMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Register a generated file to delete when the session is released.
    pub fn scratch_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_files.push(path.into());
        self
    }

    /// Prefix the command with coreutils `timeout`.
    ///
    /// The wrapper exits with `TIMEOUT_EXIT_CODE` when the bound fires.
    pub fn bounded_by(self, seconds: u64) -> Self {
        let mut args = vec![seconds.to_string(), self.program];
        args.extend(self.args);
        CommandSpec {
            program: "timeout".to_string(),
            args,
            ..self
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    pub fn stdin_source(&self) -> &StdinSource {
        &self.stdin
    }

    pub fn stdout_mode(&self) -> &OutputMode {
        &self.stdout
    }

    pub fn stderr_mode(&self) -> &OutputMode {
        &self.stderr
    }

    pub fn scratch_files(&self) -> &[PathBuf] {
        &self.scratch_files
    }

    /// Human readable command line for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit code of coreutils `timeout` when the time bound fired.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How a process ended, plus whatever it printed on captured streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub output: String,
}

impl ExitInfo {
    fn from_status(status: ExitStatus, output: String) -> Self {
        ExitInfo {
            code: status.code(),
            signal: status.signal(),
            output,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, or the negated signal number for killed processes.
    pub fn returncode(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => -signal,
            (None, None) => -1,
        }
    }
}

/// Signals used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// A captured pipe and the thread draining it.
#[derive(Debug)]
struct CapturedStream {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl CapturedStream {
    fn start<R: Read + Send + 'static>(mut stream: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let reader = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut buffer = sink.lock();
                        buffer.extend_from_slice(&chunk[..n]);
                        if buffer.len() > MAX_CAPTURE_BYTES {
                            let excess = buffer.len() - MAX_CAPTURE_BYTES;
                            buffer.drain(..excess);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
        CapturedStream {
            buffer,
            reader: Some(reader),
        }
    }

    fn join(&mut self) {
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("output drain thread panicked");
            }
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

/// A spawned external process.
///
/// Dropping a handle whose process is still running kills its process group
/// and reaps it.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    program: String,
    spawned_at: Instant,
    stdout: Option<CapturedStream>,
    stderr: Option<CapturedStream>,
    exit: Option<ExitStatus>,
}

/// Start a command in a new process group.
///
/// # Errors
/// Returns `ReadError`/`WriteError` if a redirect file cannot be opened and
/// `SpawnFailed` if the program cannot be executed.
pub fn spawn(spec: &CommandSpec) -> Result<ProcessHandle, EngineError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .process_group(0)
        .stdin(stdin_stdio(&spec.stdin)?)
        .stdout(output_stdio(&spec.stdout)?)
        .stderr(output_stdio(&spec.stderr)?);

    let mut child = command.spawn().map_err(|e| EngineError::SpawnFailed {
        program: spec.program.clone(),
        source: e,
    })?;
    let pid = child.id();
    debug!(pid, command = %spec.command_line(), "spawned process");

    let stdout = child.stdout.take().map(CapturedStream::start);
    let stderr = child.stderr.take().map(CapturedStream::start);

    Ok(ProcessHandle {
        child,
        pid,
        program: spec.program.clone(),
        spawned_at: Instant::now(),
        stdout,
        stderr,
        exit: None,
    })
}

fn stdin_stdio(source: &StdinSource) -> Result<Stdio, EngineError> {
    Ok(match source {
        StdinSource::Null => Stdio::null(),
        StdinSource::Inherit => Stdio::inherit(),
        StdinSource::File(path) => Stdio::from(File::open(path).map_err(|e| {
            EngineError::ReadError {
                path: path.clone(),
                source: e,
            }
        })?),
    })
}

fn output_stdio(mode: &OutputMode) -> Result<Stdio, EngineError> {
    Ok(match mode {
        OutputMode::Inherit => Stdio::inherit(),
        OutputMode::Null => Stdio::null(),
        OutputMode::Capture => Stdio::piped(),
        OutputMode::File(path) => Stdio::from(File::create(path).map_err(|e| {
            EngineError::WriteError {
                path: path.clone(),
                source: e,
            }
        })?),
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Time since spawn.
    pub fn elapsed(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    /// Text captured so far from stdout and stderr.
    pub fn output(&self) -> String {
        let mut text = String::new();
        for stream in [&self.stdout, &self.stderr].into_iter().flatten() {
            text.push_str(&stream.text());
        }
        text
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, EngineError> {
        if let Some(status) = self.exit {
            return Ok(Some(status));
        }
        let exited = leader_exited(self.pid, false).map_err(|e| EngineError::WaitFailed {
            pid: self.pid,
            source: e,
        })?;
        if !exited {
            return Ok(None);
        }
        self.kill_stragglers();
        let status = self.child.try_wait().map_err(|e| EngineError::WaitFailed {
            pid: self.pid,
            source: e,
        })?;
        if status.is_some() {
            self.exit = status;
        }
        Ok(status)
    }

    /// Leftover members of the group would keep captured pipes open.
    ///
    /// Only called while the leader is an unreaped zombie, so the group id
    /// cannot have been handed to anyone else.
    fn kill_stragglers(&self) {
        if self.stdout.is_some() || self.stderr.is_some() {
            let _ = signal_group(self.pid, Signal::Kill);
        }
    }

    /// Wait for the process to exit, for at most `timeout`.
    ///
    /// Returns `None` if it is still running when the wait ends. A zero
    /// timeout checks exactly once; one too large for a deadline waits
    /// until exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitInfo>, EngineError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(self.finish(status)));
            }
            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    WAIT_POLL_INTERVAL.min(left)
                }
                None => WAIT_POLL_INTERVAL,
            };
            thread::sleep(pause);
        }
    }

    /// Send a signal to the whole process group.
    ///
    /// Signalling a group that is already gone is not an error.
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal_group(self.pid, signal)
    }

    /// Block until the process exits and all captured output is drained.
    pub fn reap(&mut self) -> Result<ExitInfo, EngineError> {
        let status = match self.exit {
            Some(status) => status,
            None => {
                let pid = self.pid;
                let wait_failed = move |e: io::Error| EngineError::WaitFailed { pid, source: e };
                leader_exited(self.pid, true).map_err(wait_failed)?;
                self.kill_stragglers();
                let status = self.child.wait().map_err(wait_failed)?;
                self.exit = Some(status);
                status
            }
        };
        Ok(self.finish(status))
    }

    /// Terminate, wait `grace`, kill, reap.
    ///
    /// Never fails: a process that already exited is simply reaped. Returns
    /// `None` only if the final wait itself failed.
    pub fn shutdown(&mut self, grace: Duration) -> Option<ExitInfo> {
        if let Err(e) = self.signal(Signal::Terminate) {
            warn!(pid = self.pid, error = %e, "failed to terminate process group");
        }
        match self.wait_timeout(grace) {
            Ok(Some(info)) => return Some(info),
            Ok(None) => {}
            Err(e) => warn!(pid = self.pid, error = %e, "wait after terminate failed"),
        }

        debug!(pid = self.pid, "process ignored terminate, killing");
        if let Err(e) = self.signal(Signal::Kill) {
            warn!(pid = self.pid, error = %e, "failed to kill process group");
        }
        match self.reap() {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(pid = self.pid, error = %e, "failed to reap process");
                None
            }
        }
    }

    fn finish(&mut self, status: ExitStatus) -> ExitInfo {
        for stream in [&mut self.stdout, &mut self.stderr].into_iter().flatten() {
            stream.join();
        }
        ExitInfo::from_status(status, self.output())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = signal_group(self.pid, Signal::Kill);
            let _ = self.child.wait();
        }
    }
}

/// `sh` reports only the last stage of a pipeline, so the producer's
/// status travels back through fd 3.
fn pipe_script(producer: &str, consumer: &str) -> String {
    format!(
        "s=$( {{ {{ {}; echo $? >&3; }} | {}; }} 3>&1 ); c=$?; \
         if [ \"$s\" -ne 0 ]; then exit \"$s\"; fi; exit \"$c\"",
        producer, consumer
    )
}

/// Whether the leader has exited, leaving it unreaped.
///
/// With `block` set, waits for the exit.
fn leader_exited(pid: u32, block: bool) -> io::Result<bool> {
    let id = libc::id_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    let mut flags = libc::WEXITED | libc::WNOWAIT;
    if !block {
        flags |= libc::WNOHANG;
    }
    loop {
        // SAFETY: an all-zero siginfo_t is valid, and waitid only writes
        // into the struct we pass.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::waitid(libc::P_PID, id, &mut info, flags) };
        if rc == 0 {
            // SAFETY: waitid succeeded, so si_pid is initialised (zero when
            // WNOHANG found nothing).
            return Ok(unsafe { info.si_pid() } != 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory safety requirements; a negative pid
    // addresses the process group created at spawn.
    let rc = unsafe { libc::kill(-pgid, signal.raw()) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// True if a process with this pid still exists (zombies included).
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Remove generated files, ignoring ones that are already gone.
pub fn remove_scratch_files(paths: &[PathBuf]) {
    for path in paths {
        remove_scratch_file(path);
    }
}

fn remove_scratch_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove scratch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_exit_code_and_output() {
        let spec = CommandSpec::shell("echo hello; echo oops >&2; exit 3")
            .stdout(OutputMode::Capture)
            .stderr(OutputMode::Capture);
        let mut handle = spawn(&spec).expect("Failed to spawn");
        let info = handle
            .wait_timeout(Duration::from_secs(10))
            .expect("wait failed")
            .expect("process should exit");
        assert_eq!(info.code, Some(3));
        assert_eq!(info.returncode(), 3);
        assert!(info.output.contains("hello"));
        assert!(info.output.contains("oops"));
    }

    #[test]
    fn test_zero_wait_on_running_process() {
        let mut handle = spawn(&CommandSpec::new("sleep").arg("30")).expect("Failed to spawn");
        let waited = handle.wait_timeout(Duration::ZERO).expect("wait failed");
        assert!(waited.is_none());
        assert!(!handle.has_exited());

        let info = handle.shutdown(Duration::from_secs(2)).expect("shutdown should reap");
        assert_eq!(info.signal, Some(libc::SIGTERM));
        assert_eq!(info.returncode(), -libc::SIGTERM);
        assert!(!is_alive(handle.pid()));
    }

    #[test]
    fn test_shutdown_escalates_to_kill() {
        let spec = CommandSpec::shell("trap '' TERM; sleep 30");
        let mut handle = spawn(&spec).expect("Failed to spawn");
        // Give the shell time to install its trap
        thread::sleep(Duration::from_millis(200));
        let info = handle.shutdown(Duration::from_millis(200)).expect("shutdown should reap");
        assert_eq!(info.signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_shutdown_of_exited_process() {
        let mut handle = spawn(&CommandSpec::new("true")).expect("Failed to spawn");
        handle.reap().expect("Failed to reap");
        let info = handle.shutdown(Duration::from_millis(100)).expect("already reaped");
        assert!(info.success());
    }

    #[test]
    fn test_shutdown_kills_background_children_holding_pipes() {
        let spec = CommandSpec::shell("sleep 30 & exec sleep 30").stdout(OutputMode::Capture);
        let mut handle = spawn(&spec).expect("Failed to spawn");
        let started = Instant::now();
        handle.shutdown(Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_unbounded_wait_returns_on_exit() {
        let mut handle = spawn(&CommandSpec::shell("exit 4")).expect("Failed to spawn");
        let info = handle
            .wait_timeout(Duration::MAX)
            .expect("wait failed")
            .expect("process should exit");
        assert_eq!(info.code, Some(4));
    }

    #[test]
    fn test_reap_kills_stragglers_holding_pipes() {
        let spec = CommandSpec::shell("sleep 30 & echo started").stdout(OutputMode::Capture);
        let mut handle = spawn(&spec).expect("Failed to spawn");
        let started = Instant::now();
        let info = handle.reap().expect("Failed to reap");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(info.success());
        assert_eq!(info.output.trim(), "started");
    }

    #[test]
    fn test_stdin_and_stdout_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("in.bin");
        let dst = temp_dir.path().join("out.bin");
        std::fs::write(&src, b"payload through cat").expect("Failed to write source");

        let spec = CommandSpec::new("cat")
            .stdin(StdinSource::File(src.clone()))
            .stdout(OutputMode::File(dst.clone()));
        let mut handle = spawn(&spec).expect("Failed to spawn");
        let info = handle.reap().expect("Failed to reap");
        assert!(info.success());
        assert_eq!(std::fs::read(&dst).expect("Failed to read output"), b"payload through cat");
    }

    #[test]
    fn test_shell_positional_args_are_not_interpreted() {
        let spec = CommandSpec::shell("printf '%s' \"$1\"")
            .arg("a; echo injected $(id)")
            .stdout(OutputMode::Capture);
        let mut handle = spawn(&spec).expect("Failed to spawn");
        let info = handle.reap().expect("Failed to reap");
        assert_eq!(info.output, "a; echo injected $(id)");
    }

    #[test]
    fn test_pipe_keeps_producer_failure() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let out = temp_dir.path().join("out.bin");
        let spec = CommandSpec::pipe("echo 'Connection refused' >&2; exit 1", "cat > \"$1\"")
            .arg(path_string(&out))
            .stdout(OutputMode::Capture)
            .stderr(OutputMode::Capture);
        let info = spawn(&spec).expect("Failed to spawn").reap().expect("Failed to reap");
        assert_eq!(info.code, Some(1));
        assert!(info.output.contains("Connection refused"));
        assert_eq!(std::fs::read(&out).expect("consumer ran").len(), 0);
    }

    #[test]
    fn test_pipe_reports_consumer_status() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let out = temp_dir.path().join("out.bin");
        let spec = CommandSpec::pipe("printf 'abc'", "cat > \"$1\"").arg(path_string(&out));
        let info = spawn(&spec).expect("Failed to spawn").reap().expect("Failed to reap");
        assert!(info.success());
        assert_eq!(std::fs::read(&out).expect("Failed to read output"), b"abc");

        let spec = CommandSpec::pipe("printf 'abc'", "cat > /dev/null; exit 5");
        let info = spawn(&spec).expect("Failed to spawn").reap().expect("Failed to reap");
        assert_eq!(info.code, Some(5));
    }

    fn path_string(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_bounded_by_wraps_command() {
        let spec = CommandSpec::new("ncat").args(["-l", "30001"]).bounded_by(10);
        assert_eq!(spec.program(), "timeout");
        assert_eq!(spec.argv(), &["10", "ncat", "-l", "30001"]);
        assert_eq!(spec.command_line(), "timeout 10 ncat -l 30001");
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = spawn(&CommandSpec::new("definitely-not-a-real-program-xyz"))
            .expect_err("spawn should fail");
        assert!(matches!(err, EngineError::SpawnFailed { .. }));
    }

    #[test]
    fn test_missing_stdin_file() {
        let spec = CommandSpec::new("cat").stdin(StdinSource::File(PathBuf::from("/nonexistent/in")));
        let err = spawn(&spec).expect_err("spawn should fail");
        assert!(matches!(err, EngineError::ReadError { .. }));
    }
}
