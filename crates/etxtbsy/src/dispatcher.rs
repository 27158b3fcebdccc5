//! Start one worker per identity and, in bounded mode, collect their statistics.

use crate::{
    config::{Config, Iterations},
    worker::{FatalError, Worker, WorkerDeps, WorkerId, WorkerStats},
};
use anyhow::{anyhow, Context as _, Result};
use slog::{error, Logger};
use std::{process, thread};

/// What a worker does when it hits a fatal error.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FatalPolicy {
    /// Log the error and terminate the whole process with exit code 2.
    #[default]
    ExitProcess,

    /// Hand the error back to the dispatcher.
    Return,
}

fn run_worker<DepsT: WorkerDeps>(
    worker: Worker<DepsT>,
    policy: FatalPolicy,
) -> Result<WorkerStats, FatalError> {
    let id = worker.id();
    let log = worker.log().clone();
    worker.run().inspect_err(|err| {
        if policy == FatalPolicy::ExitProcess {
            error!(log, "{err}");
            process::exit(err.exit_code().as_u8().into());
        }
    })
}

/// Run `config.workers` workers. Identity 0 runs on the calling thread and the rest on threads
/// named `worker-<identity>`. The workers start as soon as they are spawned.
///
/// With unbounded iterations and [`FatalPolicy::ExitProcess`], this only returns if setup fails.
/// With bounded iterations, every worker is joined and the statistics are returned in identity
/// order. Under [`FatalPolicy::Return`], the first fatal error in identity order is returned
/// instead. It can be recovered with `downcast_ref::<FatalError>()`.
pub fn run<DepsT, NewDepsT>(
    config: &Config,
    log: &Logger,
    policy: FatalPolicy,
    mut new_deps: NewDepsT,
) -> Result<Vec<WorkerStats>>
where
    DepsT: WorkerDeps + Send + 'static,
    NewDepsT: FnMut(WorkerId) -> DepsT,
{
    config.validate()?;

    let mut workers = (0..config.workers)
        .map(WorkerId::from)
        .map(|id| Worker::new(id, config, new_deps(id), log))
        .collect::<Result<Vec<_>>>()?;
    let rest = workers.split_off(1);
    let first = workers.pop().ok_or_else(|| anyhow!("no workers"))?;

    let handles = rest
        .into_iter()
        .map(|worker| {
            let id = worker.id();
            thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || run_worker(worker, policy))
                .map(|handle| (id, handle))
                .with_context(|| format!("spawning thread for worker {id}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let first_id = first.id();
    let first_result = run_worker(first, policy);

    if config.iterations == Iterations::Unbounded {
        // Only a fatal error gets us here. The other workers keep running detached.
        return first_result
            .map(|stats| vec![stats])
            .with_context(|| format!("worker {first_id}"));
    }

    let mut results = vec![(first_id, first_result)];
    for (id, handle) in handles {
        let result = handle
            .join()
            .map_err(|_| anyhow!("worker {id} panicked"))?;
        results.push((id, result));
    }
    results
        .into_iter()
        .map(|(id, result)| result.with_context(|| format!("worker {id}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deps::LinuxDeps, log::test_logger};
    use etxtbsy_child::ExecArgs;
    use etxtbsy_linux::{Errno, ExitCode, FileMode, FlockOperation, OpenFlags, Pid, WaitStatus};
    use std::{
        collections::BTreeMap,
        ffi::{CStr, CString},
        fs,
        sync::{Arc, Mutex},
    };

    /// Records, per thread name, every path the worker on that thread opened and forked.
    #[derive(Default)]
    struct Shared {
        opened: BTreeMap<String, Vec<CString>>,
        forked: BTreeMap<String, usize>,
    }

    struct TestDeps {
        shared: Arc<Mutex<Shared>>,
        fail_fork: bool,
    }

    fn thread_name() -> String {
        thread::current().name().unwrap_or("<unnamed>").to_owned()
    }

    impl WorkerDeps for TestDeps {
        type Fd = ();

        fn open(&mut self, path: &CStr, _: OpenFlags, _: FileMode) -> Result<(), Errno> {
            let mut shared = self.shared.lock().unwrap();
            shared
                .opened
                .entry(thread_name())
                .or_default()
                .push(path.into());
            Ok(())
        }

        fn write(&mut self, _: &(), buf: &[u8]) -> Result<usize, Errno> {
            Ok(buf.len())
        }

        fn flock(&mut self, _: &(), _: FlockOperation) -> Result<(), Errno> {
            Ok(())
        }

        fn close(&mut self, _: ()) {}

        fn fork_exec(&mut self, _: &ExecArgs) -> Result<Pid, Errno> {
            if self.fail_fork {
                return Err(Errno::EAGAIN);
            }
            *self
                .shared
                .lock()
                .unwrap()
                .forked
                .entry(thread_name())
                .or_default() += 1;
            Ok(Pid::from_raw(1000))
        }

        fn waitpid(&mut self, _: Pid) -> Result<WaitStatus, Errno> {
            Ok(WaitStatus::Exited(ExitCode::SUCCESS))
        }
    }

    fn config(workers: usize, iterations: u64) -> Config {
        Config {
            workers,
            scratch_dir: "/scratch".into(),
            iterations: Iterations::Bounded(iterations),
            ..Default::default()
        }
    }

    #[test]
    fn workers_run_on_named_threads_with_own_paths() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let caller = thread_name();
        let stats = run(&config(3, 4), &test_logger(), FatalPolicy::Return, |_| {
            TestDeps {
                shared: shared.clone(),
                fail_fork: false,
            }
        })
        .unwrap();

        assert_eq!(
            stats,
            vec![
                WorkerStats {
                    iterations: 4,
                    anomalies: 0
                };
                3
            ]
        );

        let shared = shared.lock().unwrap();
        let expected = |id: usize| -> Vec<CString> {
            vec![CString::new(format!("/scratch/fork-exec-{id}")).unwrap(); 8]
        };
        assert_eq!(shared.opened[&caller], expected(0));
        assert_eq!(shared.opened["worker-1"], expected(1));
        assert_eq!(shared.opened["worker-2"], expected(2));
        assert_eq!(shared.opened.len(), 3);
        assert_eq!(shared.forked["worker-1"], 4);
    }

    #[test]
    fn single_worker_runs_on_calling_thread() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let stats = run(&config(1, 2), &test_logger(), FatalPolicy::Return, |_| {
            TestDeps {
                shared: shared.clone(),
                fail_fork: false,
            }
        })
        .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(
            shared.lock().unwrap().opened.keys().collect::<Vec<_>>(),
            vec![&thread_name()]
        );
    }

    #[test]
    fn fatal_error_in_spawned_worker_is_returned() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let err = run(&config(3, 4), &test_logger(), FatalPolicy::Return, |id| {
            TestDeps {
                shared: shared.clone(),
                fail_fork: id.as_usize() == 1,
            }
        })
        .unwrap_err();

        assert_eq!(err.to_string(), "worker 1");
        assert_eq!(
            err.downcast_ref::<FatalError>(),
            Some(&FatalError::Syscall {
                operation: "fork",
                errno: Errno::EAGAIN
            })
        );

        // The other workers are unaffected.
        let shared = shared.lock().unwrap();
        assert_eq!(shared.forked["worker-2"], 4);
        assert!(!shared.forked.contains_key("worker-1"));
    }

    #[test]
    fn invalid_config_fails_before_any_worker_starts() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let result = run(&config(0, 4), &test_logger(), FatalPolicy::Return, |_| {
            TestDeps {
                shared: shared.clone(),
                fail_fork: false,
            }
        });
        assert!(result.is_err());
        assert!(shared.lock().unwrap().opened.is_empty());
    }

    #[test]
    fn zero_iterations_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            workers: 4,
            scratch_dir: dir.path().into(),
            iterations: Iterations::Bounded(0),
            ..Default::default()
        };
        let stats = run(&config, &test_logger(), FatalPolicy::Return, |_| LinuxDeps).unwrap();
        assert_eq!(stats, vec![WorkerStats::default(); 4]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
