use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::http::{ClientManager, HttpClient};

/// Runs one popped job on a worker thread. Receives the queue so jobs can
/// fan out follow-up jobs (a collection job queueing its shard jobs).
pub type Processor<J> = dyn Fn(&HttpClient, J, &TaskQueue<J>) + Send + Sync;

/// FIFO job queue drained by a fixed pool of worker threads, each owning one
/// long-lived HTTP client.
pub struct TaskQueue<J: Send + 'static> {
    inner: Arc<Inner<J>>,
}

impl<J: Send + 'static> Clone for TaskQueue<J> {
    fn clone(&self) -> Self {
        TaskQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<J: Send + 'static> {
    state: Mutex<State<J>>,
    job_added: Condvar,
    job_done: Condvar,
    processor: Box<Processor<J>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct State<J> {
    jobs: VecDeque<J>,
    busy: usize,
    shutdown: bool,
}

impl<J: Send + 'static> TaskQueue<J> {
    pub fn new(processor: Box<Processor<J>>) -> Self {
        TaskQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    jobs: VecDeque::new(),
                    busy: 0,
                    shutdown: false,
                }),
                job_added: Condvar::new(),
                job_done: Condvar::new(),
                processor,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn spawn_workers(&self, manager: &ClientManager, count: u32) {
        let mut workers = self.inner.workers.lock().unwrap();
        for _ in 0..count {
            let queue = self.clone();
            let client = manager.client();
            workers.push(std::thread::spawn(move || queue.worker_loop(client)));
        }
    }

    fn worker_loop(&self, client: HttpClient) {
        loop {
            let job = {
                let mut st = self.inner.state.lock().unwrap();
                loop {
                    if st.shutdown {
                        return;
                    }
                    if let Some(job) = st.jobs.pop_front() {
                        st.busy += 1;
                        break job;
                    }
                    st = self.inner.job_added.wait(st).unwrap();
                }
            };

            (self.inner.processor)(&client, job, self);

            let mut st = self.inner.state.lock().unwrap();
            st.busy -= 1;
            self.inner.job_done.notify_all();
        }
    }

    pub fn queue_job(&self, job: J) {
        let mut st = self.inner.state.lock().unwrap();
        st.jobs.push_back(job);
        self.inner.job_added.notify_one();
    }

    /// Drop all pending jobs. Jobs already running finish normally; this is
    /// how a worker error makes the remaining work return promptly.
    pub fn clear_queue(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.jobs.clear();
        self.inner.job_done.notify_all();
    }

    /// Block until every queued job has been consumed and finished, including
    /// jobs queued by running jobs.
    pub fn wait_for_idle(&self) {
        let mut st = self.inner.state.lock().unwrap();
        while !st.jobs.is_empty() || st.busy > 0 {
            st = self.inner.job_done.wait(st).unwrap();
        }
    }

    /// Stop the workers and join them. Pending jobs are discarded.
    pub fn shutdown(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.shutdown = true;
            st.jobs.clear();
            self.inner.job_added.notify_all();
        }
        let workers = {
            let mut workers = self.inner.workers.lock().unwrap();
            std::mem::take(&mut *workers)
        };
        for handle in workers {
            let _ = handle.join();
        }
    }
}
