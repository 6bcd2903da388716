use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Wakes idle workers when new jobs are queued.
///
/// Workers read [`generation`](JobNotifier::generation) before polling the
/// store and wait only while it is unchanged, so a notification that lands
/// between the poll and the wait is never lost.
#[derive(Debug, Default)]
pub struct JobNotifier {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl JobNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.lock().map(|g| *g).unwrap_or(0)
    }

    /// One job was queued; wake one idle worker.
    pub fn notify_one(&self) {
        self.bump();
        self.cv.notify_one();
    }

    /// Wake every idle worker (shutdown).
    pub fn notify_all(&self) {
        self.bump();
        self.cv.notify_all();
    }

    fn bump(&self) {
        if let Ok(mut g) = self.generation.lock() {
            *g = g.wrapping_add(1);
        }
    }

    /// Block until the generation moves past `seen` or `timeout` elapses.
    pub fn wait(&self, seen: u64, timeout: Duration) {
        let Ok(guard) = self.generation.lock() else {
            std::thread::sleep(timeout);
            return;
        };
        let _ = self.cv.wait_timeout_while(guard, timeout, |g| *g == seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn notification_before_wait_is_not_lost() {
        let n = JobNotifier::new();
        let seen = n.generation();
        n.notify_one();

        let started = Instant::now();
        n.wait(seen, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out_without_notification() {
        let n = JobNotifier::new();
        let started = Instant::now();
        n.wait(n.generation(), Duration::from_millis(20));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn notify_wakes_a_waiting_thread() {
        let n = Arc::new(JobNotifier::new());
        let seen = n.generation();
        let waiter = {
            let n = Arc::clone(&n);
            thread::spawn(move || {
                let started = Instant::now();
                n.wait(seen, Duration::from_secs(10));
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(20));
        n.notify_all();
        assert!(waiter.join().unwrap() < Duration::from_secs(5));
    }
}
