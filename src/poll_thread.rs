//! Background worker that blocks in `poll()` on behalf of an engine.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send>;

struct Mailbox {
    state: Mutex<MailboxState>,
    condvar: Condvar,
}

struct MailboxState {
    tasks: Vec<Task>,
    running: bool,
}

/// A single worker thread fed through a task mailbox.
///
/// The engines use exactly one task kind: block in the device's `poll` and
/// report back through the client. Stopping the thread first drains every
/// posted task; an in-flight poll is cancelled by writing the device's
/// interrupt eventfd before calling [`PollThread::stop`].
pub struct PollThread {
    name: &'static str,
    mailbox: Arc<Mailbox>,
    handle: Option<JoinHandle<()>>,
}

impl PollThread {
    pub fn new(name: &'static str) -> PollThread {
        PollThread {
            name,
            mailbox: Arc::new(Mailbox {
                state: Mutex::new(MailboxState {
                    tasks: Vec::new(),
                    running: false,
                }),
                condvar: Condvar::new(),
            }),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Starts the worker. Starting a running thread is a no-op.
    pub fn start(&mut self) {
        log::debug!("{}: start (running={})", self.name, self.is_running());
        if self.handle.is_some() {
            return;
        }

        {
            let mut state = self.mailbox.state.lock().unwrap();
            state.running = true;
        }

        let mailbox = self.mailbox.clone();
        let name = self.name;
        self.handle = Some(
            std::thread::Builder::new()
                .name(name.into())
                .spawn(move || run_mailbox(&mailbox))
                .expect("failed to spawn poll thread"),
        );
    }

    /// Stops the worker, draining all posted tasks first. Stopping a stopped
    /// thread is a no-op.
    pub fn stop(&mut self) {
        log::debug!("{}: stop (running={})", self.name, self.is_running());
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };

        {
            let mut state = self.mailbox.state.lock().unwrap();
            state.running = false;
        }

        self.mailbox.condvar.notify_all();
        handle.join().expect("poll thread panicked");
    }

    /// Appends a task to the mailbox and wakes the worker.
    pub fn post<F: FnOnce() + Send + 'static>(&self, task: F) {
        log::debug!("{}: post task", self.name);

        {
            let mut state = self.mailbox.state.lock().unwrap();
            state.tasks.push(Box::new(task));
        }

        self.mailbox.condvar.notify_all();
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_mailbox(mailbox: &Mailbox) {
    loop {
        let mut local = Vec::new();
        {
            let mut state = mailbox.state.lock().unwrap();
            while state.tasks.is_empty() && state.running {
                state = mailbox.condvar.wait(state).unwrap();
            }

            if !state.running {
                // Drain whatever is left, then exit.
                for task in state.tasks.drain(..) {
                    task();
                }
                return;
            }

            std::mem::swap(&mut state.tasks, &mut local);
        }

        // Run outside the lock so posters are never blocked on a task.
        for task in local {
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn executes_posted_tasks() {
        let mut thread = PollThread::new("test-poll");
        thread.start();

        let (tx, rx) = mpsc::channel();
        thread.post(move || tx.send(42usize).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);

        thread.stop();
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut thread = PollThread::new("test-poll");
        thread.start();
        thread.start();
        assert!(thread.is_running());

        thread.stop();
        thread.stop();
        assert!(!thread.is_running());
    }

    #[test]
    fn drains_tasks_on_stop() {
        let counter = Arc::new(AtomicUsize::new(0));

        let mut thread = PollThread::new("test-poll");
        thread.start();
        for _ in 0..16 {
            let counter = counter.clone();
            thread.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        thread.stop();

        // Every posted task must have run before stop() returned.
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn tasks_run_in_post_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut thread = PollThread::new("test-poll");
        thread.start();
        for i in 0..8 {
            let order = order.clone();
            thread.post(move || order.lock().unwrap().push(i));
        }
        thread.stop();

        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn restart_after_stop() {
        let mut thread = PollThread::new("test-poll");
        thread.start();
        thread.stop();
        thread.start();

        let (tx, rx) = mpsc::channel();
        thread.post(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        thread.stop();
    }
}
