//! Function wrappers for the Linux syscalls used by etxtbsy.
//!
//! Everything here is safe to call between `fork` and `execve` in a multi-threaded process: no
//! function allocates or takes a lock.
#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

use core::{
    ffi::{c_char, c_int, c_uint, CStr},
    fmt::{self, Debug, Formatter},
    mem,
};
use derive_more::{BitOr, Display};
use libc::pid_t;

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Errno(c_int);

impl Errno {
    pub const ENOENT: Self = Self(libc::ENOENT);
    pub const EIO: Self = Self(libc::EIO);
    pub const ENOEXEC: Self = Self(libc::ENOEXEC);
    pub const EBADF: Self = Self(libc::EBADF);
    pub const ECHILD: Self = Self(libc::ECHILD);
    pub const EAGAIN: Self = Self(libc::EAGAIN);
    pub const EACCES: Self = Self(libc::EACCES);
    pub const ETXTBSY: Self = Self(libc::ETXTBSY);
    pub const ENOSPC: Self = Self(libc::ENOSPC);
    pub const EWOULDBLOCK: Self = Self(libc::EWOULDBLOCK);

    /// The errno truncated to an exit status. Every Linux errno fits.
    pub fn as_exit_code(self) -> ExitCode {
        ExitCode(self.0 as u8)
    }

    fn last() -> Self {
        Self(unsafe { *libc::__errno_location() })
    }

    fn result<T: IsMinusOne>(value: T) -> Result<T, Self> {
        if value.is_minus_one() {
            Err(Self::last())
        } else {
            Ok(value)
        }
    }
}

impl From<ExitCode> for Errno {
    fn from(code: ExitCode) -> Self {
        Self(code.0.into())
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut buf: [c_char; 128] = [0; 128];
        let ret = unsafe { libc::strerror_r(self.0, buf.as_mut_ptr(), buf.len()) };
        if ret != 0 {
            return write!(f, "Unknown error {}", self.0);
        }
        let desc = unsafe { CStr::from_ptr(buf.as_ptr()) };
        match desc.to_str() {
            Ok(desc) => f.write_str(desc),
            Err(_) => write!(f, "Unknown error {}", self.0),
        }
    }
}

impl Debug for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}, \"{self}\")", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Errno {}

trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

impl IsMinusOne for c_int {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for isize {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fd(c_int);

pub trait AsFd {
    fn fd(&self) -> Fd;
}

/// A file descriptor that is closed when dropped. Any error from `close` is ignored.
#[derive(Debug)]
pub struct OwnedFd(Fd);

impl OwnedFd {
    pub fn into_fd(self) -> Fd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsFd for OwnedFd {
    fn fd(&self) -> Fd {
        self.0
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

#[derive(BitOr, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpenFlags(c_int);

impl OpenFlags {
    pub const RDONLY: Self = Self(libc::O_RDONLY);
    pub const WRONLY: Self = Self(libc::O_WRONLY);
    pub const CREAT: Self = Self(libc::O_CREAT);
    pub const TRUNC: Self = Self(libc::O_TRUNC);
    pub const CLOEXEC: Self = Self(libc::O_CLOEXEC);
}

#[derive(BitOr, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileMode(c_uint);

impl FileMode {
    pub const RWXU: Self = Self(0o0700);
    pub const RUSR: Self = Self(0o0400);
    pub const WUSR: Self = Self(0o0200);
    pub const RWXG: Self = Self(0o0070);
    pub const RWXO: Self = Self(0o0007);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

pub fn open(path: &CStr, flags: OpenFlags, mode: FileMode) -> Result<OwnedFd, Errno> {
    let fd = Errno::result(unsafe { libc::open(path.as_ptr(), flags.0, mode.0) })?;
    Ok(OwnedFd(Fd(fd)))
}

pub fn read(fd: &impl AsFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let buf_ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let ret = Errno::result(unsafe { libc::read(fd.fd().0, buf_ptr, buf.len()) })?;
    Ok(ret as usize)
}

pub fn write(fd: &impl AsFd, buf: &[u8]) -> Result<usize, Errno> {
    let buf_ptr = buf.as_ptr() as *const libc::c_void;
    let ret = Errno::result(unsafe { libc::write(fd.fd().0, buf_ptr, buf.len()) })?;
    Ok(ret as usize)
}

pub fn close(fd: Fd) -> Result<(), Errno> {
    Errno::result(unsafe { libc::close(fd.0) }).map(drop)
}

#[derive(BitOr, Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlockOperation(c_int);

impl FlockOperation {
    pub const SHARED: Self = Self(libc::LOCK_SH);
    pub const EXCLUSIVE: Self = Self(libc::LOCK_EX);
    pub const NONBLOCK: Self = Self(libc::LOCK_NB);
}

/// Apply or remove an advisory lock. The lock belongs to the open file description, so it is
/// dropped when the last descriptor referring to it is closed.
pub fn flock(fd: &impl AsFd, operation: FlockOperation) -> Result<(), Errno> {
    Errno::result(unsafe { libc::flock(fd.fd().0, operation.0) }).map(drop)
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub struct Pid(pid_t);

impl Pid {
    pub fn from_raw(pid: pid_t) -> Self {
        Self(pid)
    }
}

/// Returns `Some(child_pid)` in the parent and `None` in the child.
///
/// If the calling process is multi-threaded, the child may only call async-signal-safe functions
/// until it calls `execve` or `_exit`.
pub fn fork() -> Result<Option<Pid>, Errno> {
    let pid = Errno::result(unsafe { libc::fork() })?;
    Ok((pid != 0).then_some(Pid(pid)))
}

/// Replace the process image. `argv` and `envp` must be terminated with `None`. This only
/// returns on failure.
pub fn execve(path: &CStr, argv: &[Option<&u8>], envp: &[Option<&u8>]) -> Result<(), Errno> {
    let argv_ptr = argv.as_ptr() as *const *const c_char;
    let envp_ptr = envp.as_ptr() as *const *const c_char;
    Errno::result(unsafe { libc::execve(path.as_ptr(), argv_ptr, envp_ptr) }).map(drop)
}

pub fn _exit(status: ExitCode) -> ! {
    unsafe { libc::_exit(status.0.into()) }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub struct ExitCode(u8);

impl ExitCode {
    pub const SUCCESS: Self = Self(0);

    pub const fn from_u8(code: u8) -> Self {
        Self(code)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub struct Signal(c_int);

impl Signal {
    pub const KILL: Self = Self(libc::SIGKILL);
    pub const SEGV: Self = Self(libc::SIGSEGV);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitStatus {
    Exited(ExitCode),
    Signaled(Signal),
}

impl WaitStatus {
    fn from_raw(status: c_int) -> Self {
        // Without WUNTRACED or WCONTINUED, waitpid only reports terminated children.
        if libc::WIFEXITED(status) {
            WaitStatus::Exited(ExitCode(libc::WEXITSTATUS(status) as u8))
        } else {
            WaitStatus::Signaled(Signal(libc::WTERMSIG(status)))
        }
    }
}

/// Block until the given child terminates.
pub fn waitpid(pid: Pid) -> Result<WaitStatus, Errno> {
    let mut status: c_int = 0;
    Errno::result(unsafe { libc::waitpid(pid.0, &mut status, 0) })?;
    Ok(WaitStatus::from_raw(status))
}
