//! Helper library for etxtbsy workers.
//!
//! This code is run in the child process after the call to `fork`. Since the forking process is
//! multi-threaded, there is very little that we can do safely. In particular, we can't allocate
//! from the heap. Everything the child needs is prepared by the parent before forking. This
//! library is separate so we can make it `no_std` and manage its dependencies carefully.
#![no_std]

#[cfg(test)]
extern crate std;

use core::ffi::CStr;
use etxtbsy_linux::{self as linux, ExitCode};

/// Arguments for `execve`, borrowed from storage owned by the parent. The program is run with
/// `argv[0]` set to its own path, no other arguments, and an empty environment.
pub struct ExecArgs<'a> {
    program: &'a CStr,
    argv: [Option<&'a u8>; 2],
    envp: [Option<&'a u8>; 1],
}

impl<'a> ExecArgs<'a> {
    pub fn new(program: &'a CStr) -> Self {
        let argv0 = program.to_bytes_with_nul().first();
        Self {
            program,
            argv: [argv0, None],
            envp: [None],
        }
    }

    pub fn program(&self) -> &'a CStr {
        self.program
    }
}

/// Replace the child with the program. If `execve` fails, the child exits immediately with the
/// errno as its exit status.
pub fn exec_or_exit(args: &ExecArgs) -> ! {
    let status = match linux::execve(args.program, &args.argv, &args.envp) {
        Err(errno) => errno.as_exit_code(),
        Ok(()) => ExitCode::from_u8(u8::MAX),
    };
    linux::_exit(status)
}
