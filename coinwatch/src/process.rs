use log::{debug, warn};
use std::fmt::{Display, Formatter};
use std::io::{self, BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cancellation token shared by the scheduler, the front-end watcher and analysis runs.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, signal) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps up to `timeout`, returning early with `true` once shutdown is triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, signal) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = signal
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessCommand {
    program: String,
    args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        ProcessCommand {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Splits a command line on whitespace, e.g. `python3 Analysis.py`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(ProcessCommand {
            program,
            args: parts.collect(),
        })
    }
}

impl Display for ProcessCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A running collaborator process.
pub struct ProcessHandle {
    command: ProcessCommand,
    child: Child,
}

impl ProcessHandle {
    pub fn start(command: &ProcessCommand, capture_output: bool) -> io::Result<Self> {
        let stdout = if capture_output {
            Stdio::piped()
        } else {
            Stdio::inherit()
        };

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .spawn()?;
        debug!("started '{}' as pid {}", command, child.id());

        Ok(ProcessHandle {
            command: command.clone(),
            child,
        })
    }

    /// Collects standard output line by line. Reading stops early once shutdown is
    /// triggered, returning what was read so far.
    pub fn read_output(&mut self, shutdown: &Shutdown) -> io::Result<Vec<String>> {
        let stdout = self.child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "process output is not captured")
        })?;

        let mut lines = Vec::new();
        for line in BufReader::new(stdout).lines() {
            lines.push(line?);
            if shutdown.is_triggered() {
                debug!("shutdown while reading '{}', stopping", self.command);
                break;
            }
        }
        Ok(lines)
    }

    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }

    pub fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        self.child.kill()?;
        self.child.wait()
    }

    /// Moves the process onto a watcher thread that triggers `shutdown` when it exits.
    pub fn watch(mut self, shutdown: Shutdown) -> JoinHandle<io::Result<ExitStatus>> {
        thread::spawn(move || {
            let status = self.child.wait();
            debug!("'{}' exited: {:?}", self.command, status);
            shutdown.trigger();
            status
        })
    }
}

/// Starts the front-end and watches it on its own thread until it exits.
pub fn watch_frontend(
    command: &ProcessCommand,
    shutdown: &Shutdown,
) -> Result<JoinHandle<io::Result<ExitStatus>>, crate::Error> {
    let frontend = ProcessHandle::start(command, false).map_err(crate::Error::FrontendError)?;
    Ok(frontend.watch(shutdown.clone()))
}

/// Runs `command` on a worker thread and waits for its standard output.
pub fn capture_output(command: &ProcessCommand, shutdown: &Shutdown) -> io::Result<Vec<String>> {
    let command = command.clone();
    let shutdown = shutdown.clone();

    let worker = thread::spawn(move || -> io::Result<Vec<String>> {
        let mut process = ProcessHandle::start(&command, true)?;
        let output = process.read_output(&shutdown)?;
        let status = if shutdown.is_triggered() {
            process.terminate()?
        } else {
            process.wait()?
        };

        if !status.success() {
            if output.is_empty() && !shutdown.is_triggered() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("'{}' exited with {} and printed nothing", command, status),
                ));
            }
            warn!("'{}' exited with {}", command, status);
        }
        Ok(output)
    });

    worker
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "analysis worker panicked"))?
}
