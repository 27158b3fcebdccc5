use crate::worker::WorkerDeps;
use etxtbsy_child::ExecArgs;
use etxtbsy_linux::{
    self as linux, Errno, FileMode, FlockOperation, OpenFlags, OwnedFd, Pid, WaitStatus,
};
use std::ffi::CStr;

/// The real syscalls.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxDeps;

impl WorkerDeps for LinuxDeps {
    type Fd = OwnedFd;

    fn open(&mut self, path: &CStr, flags: OpenFlags, mode: FileMode) -> Result<OwnedFd, Errno> {
        linux::open(path, flags, mode)
    }

    fn write(&mut self, fd: &OwnedFd, buf: &[u8]) -> Result<usize, Errno> {
        linux::write(fd, buf)
    }

    fn flock(&mut self, fd: &OwnedFd, operation: FlockOperation) -> Result<(), Errno> {
        linux::flock(fd, operation)
    }

    fn close(&mut self, fd: OwnedFd) {
        drop(fd);
    }

    fn fork_exec(&mut self, args: &ExecArgs) -> Result<Pid, Errno> {
        match linux::fork()? {
            Some(pid) => Ok(pid),
            None => etxtbsy_child::exec_or_exit(args),
        }
    }

    fn waitpid(&mut self, pid: Pid) -> Result<WaitStatus, Errno> {
        linux::waitpid(pid)
    }
}
