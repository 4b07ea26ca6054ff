//! Parallel task execution for refinement workers and STW GC workers.

/// A unit of parallel work executed by every active worker of a pool.
pub trait WorkerTask: Sync {
    fn name(&self) -> &'static str;

    /// Perform this task's share of work. Called once per active worker;
    /// work distribution happens inside via claim counters.
    fn work(&self, worker_id: usize);
}

/// A pool of worker threads identified by name.
///
/// Workers are spawned per task via scoped threads: the pools here run one
/// homogeneous task at a time to completion, so there is nothing for a
/// resident thread to do between tasks.
pub struct WorkerThreads {
    name: &'static str,
    max_workers: usize,
}

impl WorkerThreads {
    pub fn new(name: &'static str, max_workers: usize) -> Self {
        assert!(max_workers > 0, "{name}: worker pool needs at least one thread");
        WorkerThreads { name, max_workers }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `task` on `num_workers` workers and wait for all of them.
    pub fn run_task<T: WorkerTask>(&self, task: &T, num_workers: usize) {
        let num_workers = num_workers.clamp(1, self.max_workers);
        debug!("running {} using {} workers", task.name(), num_workers);
        if num_workers == 1 {
            task.work(0);
            return;
        }
        std::thread::scope(|scope| {
            for worker_id in 1..num_workers {
                let builder =
                    std::thread::Builder::new().name(format!("{}-{}", self.name, worker_id));
                builder
                    .spawn_scoped(scope, move || task.work(worker_id))
                    .expect("failed to spawn worker thread");
            }
            task.work(0);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        invocations: AtomicUsize,
    }

    impl WorkerTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting task"
        }

        fn work(&self, _worker_id: usize) {
            self.invocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn runs_once_per_worker() {
        let pool = WorkerThreads::new("test workers", 4);
        let task = CountingTask {
            invocations: AtomicUsize::new(0),
        };
        pool.run_task(&task, 4);
        assert_eq!(task.invocations.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn clamps_worker_count() {
        let pool = WorkerThreads::new("test workers", 2);
        let task = CountingTask {
            invocations: AtomicUsize::new(0),
        };
        pool.run_task(&task, 8);
        assert_eq!(task.invocations.load(Ordering::Relaxed), 2);
    }
}
