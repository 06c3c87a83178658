//! Deferred execution of blocking work scheduled from the interrupt path.
//!
//! A `Worker` owns a thread fed through a channel. Like a kernel work item,
//! scheduling a job while a previous one is still pending (queued but not
//! started) is a no-op, which keeps at most one job of each worker in flight.
//! `flush` blocks until everything scheduled before it has run.
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace};

use crate::memory::DmaArena;

/// Statistics buffer handed to the 3A task.
#[derive(Clone)]
pub(crate) struct StatJob {
    pub slot: usize,
    pub frame_number: u32,
    pub arena: Arc<DmaArena>,
}

pub(crate) enum Job {
    Statistics(StatJob),
    SensorUpdate,
}

/// Runs the jobs of a worker on its thread.
pub(crate) trait JobHandler: Send + Sync + 'static {
    fn run_job(&self, job: Job);
}

enum WorkerCommand {
    Run(Job),
    Flush(mpsc::Sender<()>),
    Stop,
}

pub(crate) struct Worker {
    name: String,
    sender: mpsc::Sender<WorkerCommand>,
    pending: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new<H: JobHandler>(name: &str, handler: Arc<H>) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let pending = Arc::new(AtomicBool::new(false));
        let thread_pending = Arc::clone(&pending);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    match command {
                        WorkerCommand::Run(job) => {
                            // The job may be scheduled again as soon as it starts.
                            thread_pending.store(false, Ordering::Release);
                            handler.run_job(job);
                        }
                        WorkerCommand::Flush(done) => {
                            let _ = done.send(());
                        }
                        WorkerCommand::Stop => break,
                    }
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            sender,
            pending,
            handle: Some(handle),
        })
    }

    /// Queue `job`. Returns `false` if a job was already pending, in which
    /// case `job` is dropped.
    pub(crate) fn schedule(&self, job: Job) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            trace!("{}: job already pending", self.name);
            return false;
        }

        if self.sender.send(WorkerCommand::Run(job)).is_err() {
            error!("{}: worker thread is gone", self.name);
            self.pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Wait until every job scheduled so far has completed.
    pub(crate) fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.sender.send(WorkerCommand::Flush(done_tx)).is_err() {
            error!("{}: worker thread is gone", self.name);
            return;
        }
        if done_rx.recv().is_err() {
            error!("{}: worker thread exited while flushing", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        debug!("Stopping worker {}", self.name);
        let _ = self.sender.send(WorkerCommand::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{}: worker thread panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Condvar, Mutex};

    use super::*;

    #[derive(Default)]
    struct Gate {
        state: Mutex<(bool, usize)>,
        cvar: Condvar,
    }

    impl Gate {
        fn open(&self) {
            self.state.lock().unwrap().0 = true;
            self.cvar.notify_all();
        }

        fn wait_started(&self, count: usize) {
            let _s = self
                .cvar
                .wait_while(self.state.lock().unwrap(), |s| s.1 < count)
                .unwrap();
        }
    }

    impl JobHandler for Gate {
        fn run_job(&self, _job: Job) {
            let mut s = self.state.lock().unwrap();
            s.1 += 1;
            self.cvar.notify_all();
            let _s = self.cvar.wait_while(s, |s| !s.0).unwrap();
        }
    }

    #[test]
    fn test_pending_job_coalesced() {
        let gate = Arc::new(Gate::default());
        let worker = Worker::new("test-worker", Arc::clone(&gate)).unwrap();

        assert!(worker.schedule(Job::SensorUpdate));
        gate.wait_started(1);
        // The first job is running, so one more can be queued...
        assert!(worker.schedule(Job::SensorUpdate));
        // ...but not two.
        assert!(!worker.schedule(Job::SensorUpdate));

        gate.open();
        worker.flush();
        assert_eq!(gate.state.lock().unwrap().1, 2);
    }

    #[test]
    fn test_flush_waits_for_running_job() {
        let gate = Arc::new(Gate::default());
        let worker = Arc::new(Worker::new("test-worker", Arc::clone(&gate)).unwrap());

        worker.schedule(Job::SensorUpdate);
        gate.wait_started(1);

        let flushed = Arc::new(AtomicBool::new(false));
        let flusher = {
            let worker = Arc::clone(&worker);
            let flushed = Arc::clone(&flushed);
            thread::spawn(move || {
                worker.flush();
                flushed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!flushed.load(Ordering::SeqCst));
        gate.open();
        flusher.join().unwrap();
        assert!(flushed.load(Ordering::SeqCst));
    }
}
