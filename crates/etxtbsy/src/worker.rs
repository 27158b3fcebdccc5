//! The per-worker write→lock→exec→validate loop.

use crate::config::{Config, Handshake, Iterations, Payload};
use anyhow::{Context as _, Result};
use derive_more::{Add, Display, Error, From};
use etxtbsy_child::ExecArgs;
use etxtbsy_linux::{Errno, ExitCode, FileMode, FlockOperation, OpenFlags, Pid, Signal, WaitStatus};
use slog::{debug, o, warn, Logger};
use std::{
    ffi::{CStr, CString},
    os::unix::ffi::OsStringExt as _,
};

/// The exit code of the process when a worker hits an infrastructure error.
pub const FATAL_EXIT_CODE: ExitCode = ExitCode::from_u8(2);

/// Scratch files are created with every execute bit set, subject to the umask.
const SCRATCH_FILE_MODE: FileMode = FileMode::RWXU.union(FileMode::RWXG).union(FileMode::RWXO);

#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// The syscalls a worker makes. The standard implementation is [`crate::deps::LinuxDeps`].
pub trait WorkerDeps {
    type Fd;

    fn open(&mut self, path: &CStr, flags: OpenFlags, mode: FileMode) -> Result<Self::Fd, Errno>;
    fn write(&mut self, fd: &Self::Fd, buf: &[u8]) -> Result<usize, Errno>;
    fn flock(&mut self, fd: &Self::Fd, operation: FlockOperation) -> Result<(), Errno>;
    fn close(&mut self, fd: Self::Fd);

    /// Fork a child that runs `args`. Only the parent returns.
    fn fork_exec(&mut self, args: &ExecArgs) -> Result<Pid, Errno>;
    fn waitpid(&mut self, pid: Pid) -> Result<WaitStatus, Errno>;
}

/// An infrastructure failure. The harness itself is broken, so the worker must stop.
#[derive(Clone, Copy, Debug, Display, Error, Eq, PartialEq)]
pub enum FatalError {
    #[display("{operation}: {errno}")]
    Syscall {
        operation: &'static str,
        #[error(not(source))]
        errno: Errno,
    },
    #[display("waitpid not exited: child killed by signal {_0}")]
    Signaled(#[error(not(source))] Signal),
}

impl FatalError {
    fn syscall(operation: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| FatalError::Syscall { operation, errno }
    }

    pub fn exit_code(&self) -> ExitCode {
        FATAL_EXIT_CODE
    }
}

/// How a child that exited normally is judged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Clean,
    /// The child exited with a nonzero status. Either the script itself failed or `execve`
    /// failed and the child exited with the errno.
    Anomaly(ExitCode),
}

pub fn classify(status: WaitStatus) -> Result<Outcome, FatalError> {
    match status {
        WaitStatus::Exited(ExitCode::SUCCESS) => Ok(Outcome::Clean),
        WaitStatus::Exited(code) => Ok(Outcome::Anomaly(code)),
        WaitStatus::Signaled(signal) => Err(FatalError::Signaled(signal)),
    }
}

#[derive(Add, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WorkerStats {
    pub iterations: u64,
    pub anomalies: u64,
}

pub struct Worker<DepsT> {
    id: WorkerId,
    path: CString,
    payload: Payload,
    handshake: Handshake,
    iterations: Iterations,
    stats: WorkerStats,
    deps: DepsT,
    log: Logger,
}

impl<DepsT: WorkerDeps> Worker<DepsT> {
    pub fn new(id: WorkerId, config: &Config, deps: DepsT, log: &Logger) -> Result<Self> {
        let path = config.scratch_path(id);
        let path = CString::new(path.into_os_string().into_vec())
            .with_context(|| format!("scratch path for worker {id}"))?;
        Ok(Self {
            id,
            path,
            payload: config.payload.clone(),
            handshake: config.handshake,
            iterations: config.iterations,
            stats: WorkerStats::default(),
            deps,
            log: log.new(o!("worker" => id.as_usize())),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Loop until the iteration bound is reached or a fatal error occurs. With
    /// [`Iterations::Unbounded`], this only returns on error.
    pub fn run(mut self) -> Result<WorkerStats, FatalError> {
        debug!(self.log, "worker starting";
            "path" => %self.path.to_string_lossy(),
            "handshake" => %self.handshake,
        );
        while self.iterations.allows(self.stats.iterations) {
            let outcome = self.iterate()?;
            self.stats.iterations += 1;
            if let Outcome::Anomaly(code) = outcome {
                self.stats.anomalies += 1;
                warn!(self.log, "exec: {} {}", code.as_u8(), Errno::from(code);
                    "first" => self.stats.anomalies == 1,
                );
            }
        }
        Ok(self.stats)
    }

    fn iterate(&mut self) -> Result<Outcome, FatalError> {
        match self.handshake {
            Handshake::Flock => self.write_with_lock_handshake()?,
            Handshake::None => {
                let fd = self.create_and_write()?;
                self.deps.close(fd);
            }
        }
        let status = self.spawn_and_wait()?;
        classify(status)
    }

    /// Create or truncate the scratch file and write the whole payload to it. The returned
    /// descriptor is write-only and close-on-exec.
    fn create_and_write(&mut self) -> Result<DepsT::Fd, FatalError> {
        let fd = self
            .deps
            .open(
                &self.path,
                OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::CLOEXEC,
                SCRATCH_FILE_MODE,
            )
            .map_err(FatalError::syscall("open"))?;
        let mut remaining = self.payload.as_bytes();
        while !remaining.is_empty() {
            match self.deps.write(&fd, remaining) {
                Ok(0) => return Err(FatalError::syscall("write")(Errno::EIO)),
                Ok(count) => remaining = &remaining[count..],
                Err(errno) => return Err(FatalError::syscall("write")(errno)),
            }
        }
        Ok(fd)
    }

    fn write_with_lock_handshake(&mut self) -> Result<(), FatalError> {
        let fd = self.create_and_write()?;
        self.deps
            .flock(&fd, FlockOperation::EXCLUSIVE)
            .map_err(FatalError::syscall("flock"))?;
        self.deps.close(fd);

        let fd = self
            .deps
            .open(
                &self.path,
                OpenFlags::RDONLY | OpenFlags::CLOEXEC,
                SCRATCH_FILE_MODE,
            )
            .map_err(FatalError::syscall("open (readonly)"))?;
        self.deps
            .flock(&fd, FlockOperation::SHARED)
            .map_err(FatalError::syscall("flock (readonly)"))?;
        self.deps.close(fd);
        Ok(())
    }

    fn spawn_and_wait(&mut self) -> Result<WaitStatus, FatalError> {
        let args = ExecArgs::new(&self.path);
        let pid = self
            .deps
            .fork_exec(&args)
            .map_err(FatalError::syscall("fork"))?;
        self.deps
            .waitpid(pid)
            .map_err(FatalError::syscall("waitpid"))
    }
}
