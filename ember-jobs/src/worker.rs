use crate::handle::JobCompletion;
use crossbeam_channel::{Receiver, Sender};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

// One unit of deferred work. Sits in the shared queue until a worker pops it; the worker
// owns it exclusively for the duration of run.
pub(crate) struct Job {
    pub id: u64,
    pub name: String,
    pub silent: bool,
    pub task: Box<dyn FnOnce() + Send + 'static>,
    pub completion: JobCompletion,
}

pub(crate) fn run_job(job: Job) {
    profiling::scope!("run_job", &job.name);
    log::trace!("job {} ({}) starting", job.id, job.name);

    let result = std::panic::catch_unwind(AssertUnwindSafe(job.task));
    let error = match result {
        Ok(()) => None,
        Err(payload) => Some(panic_message(payload)),
    };

    if let Some(message) = &error {
        if !job.silent {
            log::error!("job {} ({}) panicked: {}", job.id, job.name, message);
        }
    }

    job.completion.fulfill(error);
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// Thread that tries to take jobs out of the request channel and ends when the finish
// channel is signalled
pub(crate) struct Worker {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl Worker {
    pub fn new(
        request_rx: Receiver<Job>,
        active_job_count: Arc<AtomicUsize>,
        thread_index: usize,
    ) -> Self {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("ember job worker {}", thread_index))
            .spawn(move || {
                profiling::register_thread!(&format!("JobWorker {}", thread_index));
                loop {
                    // Checked up front so a pending shutdown wins over queued work;
                    // anything still in the queue at shutdown is dropped, never run
                    if finish_rx.try_recv().is_ok() {
                        return;
                    }

                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            match msg {
                                Ok(job) => {
                                    run_job(job);
                                    active_job_count.fetch_sub(1, Ordering::Release);
                                }
                                // All senders gone, nothing further can arrive
                                Err(_) => return,
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })
            .unwrap();

        Worker {
            finish_tx,
            join_handle,
        }
    }

    pub fn finish(self) {
        // The worker may be blocked in select!, the finish channel wakes it
        let _ = self.finish_tx.send(());
        self.join_handle.join().unwrap();
    }
}
