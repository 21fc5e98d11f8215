//! Subprocess wrapper: fork/exec with redirected descriptors and captured
//! output streams, integrated with the event loop (spec.md §4.2).

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::event_loop::{EventLoop, Reactor};

/// The classified outcome of a terminated child (spec.md §4.2: "exit,
/// exit with nonzero code, death by signal ..., and stop").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Exited(i32),
    Signalled { signal: i32, core_dumped: bool },
    Stopped(i32),
}

impl Completion {
    pub fn from_wait_status(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Completion::Exited(code),
            WaitStatus::Signaled(_, signal, core_dumped) => Completion::Signalled {
                signal: signal as i32,
                core_dumped,
            },
            WaitStatus::Stopped(_, signal) => Completion::Stopped(signal as i32),
            // Anything else (PtraceEvent, Continued, ...) isn't reachable for
            // a plain waitpid(WNOHANG) loop over a non-traced child.
            _ => Completion::Exited(-1),
        }
    }

    pub fn is_success(&self, reclassify_exit_24_as_success: bool) -> bool {
        match self {
            Completion::Exited(0) => true,
            Completion::Exited(24) if reclassify_exit_24_as_success => true,
            _ => false,
        }
    }

    /// A human-readable rendering, e.g. `"exited with status 23"`.
    pub fn describe(&self) -> String {
        match self {
            Completion::Exited(code) => format!("exited with status {}", code),
            Completion::Signalled {
                signal,
                core_dumped,
            } => {
                if *core_dumped {
                    format!("killed by signal {} (core dumped)", signal)
                } else {
                    format!("killed by signal {}", signal)
                }
            }
            Completion::Stopped(signal) => format!("stopped by signal {}", signal),
        }
    }
}

/// Which completions the caller wants reported as an error (spec.md §4.2:
/// "throw-on-nonzero-exit, throw-on-signal-except-SIGPIPE, throw-on-SIGPIPE").
#[derive(Debug, Clone, Copy)]
pub struct CompletionPolicy {
    pub throw_on_nonzero_exit: bool,
    pub throw_on_signal_except_sigpipe: bool,
    pub throw_on_sigpipe: bool,
    /// Exit code 24 ("vanished source files") counts as success; rsbackup's
    /// backup engine sets this, bulk removal and hooks do not.
    pub reclassify_exit_24: bool,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        CompletionPolicy {
            throw_on_nonzero_exit: true,
            throw_on_signal_except_sigpipe: true,
            throw_on_sigpipe: false,
            reclassify_exit_24: false,
        }
    }
}

impl CompletionPolicy {
    pub fn check(&self, command: &str, completion: &Completion) -> anyhow::Result<()> {
        match completion {
            Completion::Exited(code) => {
                if completion.is_success(self.reclassify_exit_24) || !self.throw_on_nonzero_exit {
                    Ok(())
                } else {
                    anyhow::bail!("{}: exited with status {}", command, code);
                }
            }
            Completion::Signalled { signal, .. } => {
                let is_sigpipe = *signal == Signal::SIGPIPE as i32;
                let should_throw = if is_sigpipe {
                    self.throw_on_sigpipe
                } else {
                    self.throw_on_signal_except_sigpipe
                };
                if should_throw {
                    anyhow::bail!("{}: {}", command, completion.describe());
                }
                Ok(())
            }
            Completion::Stopped(_) => anyhow::bail!("{}: {}", command, completion.describe()),
        }
    }
}

/// A subprocess specification: argv, environment overrides, capture
/// behaviour, and an optional kill-timeout.
pub struct SubprocessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub capture_combined: bool,
    pub kill_timeout: Option<Duration>,
    pub policy: CompletionPolicy,
}

impl SubprocessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        SubprocessSpec {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            capture_combined: true,
            kill_timeout: None,
            policy: CompletionPolicy::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = Some(timeout);
        self
    }

    fn std_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd
    }

    fn command_line(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

struct CaptureState {
    buf: Vec<u8>,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    // Kept alive so the fds polled by the event loop stay open; dropped
    // (closing the fds) once this state's last Rc reference goes away.
    _stdout: std::process::ChildStdout,
    _stderr: std::process::ChildStderr,
    child: std::process::Child,
    command_line: String,
    kill_timeout: Option<Duration>,
    killed: bool,
    policy: CompletionPolicy,
    on_complete: Option<Box<dyn FnOnce(anyhow::Result<Completion>, Vec<u8>)>>,
}

struct CaptureReactor(Rc<RefCell<CaptureState>>);

impl Reactor for CaptureReactor {
    fn on_readable(&mut self, fd: RawFd, data: &[u8]) {
        let mut state = self.0.borrow_mut();
        if fd == state.stdout_fd || fd == state.stderr_fd {
            state.buf.extend_from_slice(data);
        }
    }

    fn on_read_error(&mut self, _fd: RawFd, _errno: i32) {}

    fn on_timeout(&mut self, _now: Instant) {
        let mut state = self.0.borrow_mut();
        if state.killed {
            return;
        }
        state.killed = true;
        let pid = Pid::from_raw(state.child.id() as i32);
        log::warn!(
            "{}: kill-timeout expired, sending SIGKILL",
            state.command_line
        );
        let _ = kill(pid, Signal::SIGKILL);
    }

    fn on_wait(&mut self, _pid: Pid, status: WaitStatus) {
        let mut state = self.0.borrow_mut();
        let completion = Completion::from_wait_status(status);
        let command_line = state.command_line.clone();
        let result = state.policy.check(&command_line, &completion).map(|_| completion);
        let buf = std::mem::take(&mut state.buf);
        if let Some(cb) = state.on_complete.take() {
            drop(state);
            cb(result, buf);
        }
    }
}

/// Spawns `spec` and registers it with `event_loop`; `on_complete` fires
/// once the child has exited, with the combined captured output.
pub fn spawn_captured(
    event_loop: &mut EventLoop,
    spec: SubprocessSpec,
    on_complete: impl FnOnce(anyhow::Result<Completion>, Vec<u8>) + 'static,
) -> anyhow::Result<Pid> {
    let command_line = spec.command_line();
    let mut cmd = spec.std_command();
    let mut child = cmd
        .spawn()
        .map_err(|err| anyhow::anyhow!("failed to execute {}: {}", command_line, err))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let stdout_fd = stdout.as_raw_fd();
    let stderr_fd = stderr.as_raw_fd();
    let pid = Pid::from_raw(child.id() as i32);

    let state = Rc::new(RefCell::new(CaptureState {
        buf: Vec::new(),
        stdout_fd,
        stderr_fd,
        _stdout: stdout,
        _stderr: stderr,
        child,
        command_line,
        kill_timeout: spec.kill_timeout,
        killed: false,
        policy: spec.policy,
        on_complete: Some(Box::new(on_complete)),
    }));

    let reactor: Rc<RefCell<dyn Reactor>> = Rc::new(RefCell::new(CaptureReactor(state.clone())));
    event_loop.register_readable(stdout_fd, reactor.clone());
    event_loop.register_readable(stderr_fd, reactor.clone());
    event_loop.register_child(pid, reactor.clone());

    if let Some(timeout) = state.borrow().kill_timeout {
        event_loop.register_timeout(Instant::now() + timeout, reactor);
    }

    Ok(pid)
}

/// Runs `spec` to completion on a private event loop, blocking the calling
/// thread. Used outside the action scheduler (e.g. host-reachability probes,
/// `stat`/`device-id` lookups).
pub fn run_standalone(spec: SubprocessSpec) -> anyhow::Result<(Completion, Vec<u8>)> {
    let mut event_loop = EventLoop::new();
    let result: Rc<RefCell<Option<anyhow::Result<(Completion, Vec<u8>)>>>> =
        Rc::new(RefCell::new(None));
    let result2 = result.clone();
    spawn_captured(&mut event_loop, spec, move |completion, buf| {
        *result2.borrow_mut() = Some(completion.map(|c| (c, buf)));
    })?;
    event_loop.wait(true)?;
    result
        .borrow_mut()
        .take()
        .unwrap_or_else(|| Err(anyhow::anyhow!("event loop exited without reaping child")))
}

/// Ties together `program`/`args` into a simple run for callers that just
/// want stdout+stderr on success, propagating failure.
pub fn run_command(program: &str, args: &[&str]) -> anyhow::Result<Vec<u8>> {
    let spec = SubprocessSpec::new(program).args(args.iter().map(|s| s.to_string()));
    let (_, output) = run_standalone(spec)?;
    Ok(output)
}
