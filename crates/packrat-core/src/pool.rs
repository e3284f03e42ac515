//! Fixed-size worker pool used by the backup, restore and verify engines.
//!
//! Per-worker scratch buffers are pre-allocated and handed out through a
//! bounded channel of capacity `max_dop`; tasks block on checkout, so at
//! most `max_dop` scratch buffers ever exist.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{PackratError, Result};

/// Default worker count.
pub const DEFAULT_MAX_DOP: usize = 3;
/// Inclusive bounds on the worker count.
pub const MAX_DOP_RANGE: std::ops::RangeInclusive<usize> = 1..=100;

/// Validate a `max_dop` parameter.
pub fn check_max_dop(max_dop: usize) -> Result<usize> {
    if MAX_DOP_RANGE.contains(&max_dop) {
        Ok(max_dop)
    } else {
        Err(PackratError::ParallelismOutOfRange(max_dop))
    }
}

/// Reusable per-worker buffer for whole chunks of file data.
pub struct Scratch {
    pub buf: Vec<u8>,
}

impl Scratch {
    fn new() -> Self {
        Scratch { buf: Vec::new() }
    }

    /// Resize the buffer to exactly `len`, reusing capacity across tasks.
    pub fn resize(&mut self, len: usize) -> &mut [u8] {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
        &mut self.buf[..len]
    }
}

/// Bounded pool of scratch buffers, drained and discarded with the task
/// group that created it.
pub struct ScratchPool {
    slots: Receiver<Scratch>,
    returns: Sender<Scratch>,
}

impl ScratchPool {
    pub fn new(max_dop: usize) -> Self {
        let (returns, slots) = bounded(max_dop);
        for _ in 0..max_dop {
            returns.send(Scratch::new()).expect("pool channel sized to fit");
        }
        ScratchPool { slots, returns }
    }

    pub fn checkout(&self) -> Scratch {
        self.slots.recv().expect("pool senders never close first")
    }

    pub fn checkin(&self, scratch: Scratch) {
        self.returns
            .send(scratch)
            .expect("pool channel sized to fit");
    }
}

/// Fan `tasks` out to `max_dop` workers and wait for all of them.
///
/// Workers pull from a bounded queue and run `work` with a scratch buffer
/// checked out of the pool for the duration of each task. Failures are the
/// caller's to record inside `work`; the pool itself never aborts early.
pub fn run_tasks<T, F>(max_dop: usize, tasks: Vec<T>, work: F)
where
    T: Send,
    F: Fn(T, &mut Scratch) + Sync,
{
    if tasks.is_empty() {
        return;
    }
    let workers = max_dop.min(tasks.len());
    let pool = ScratchPool::new(workers);
    let (tx, rx) = bounded::<T>(workers);

    std::thread::scope(|s| {
        for _ in 0..workers {
            let rx = rx.clone();
            let pool = &pool;
            let work = &work;
            s.spawn(move || {
                for task in rx.iter() {
                    let mut scratch = pool.checkout();
                    work(task, &mut scratch);
                    pool.checkin(scratch);
                }
            });
        }
        drop(rx);
        for task in tasks {
            if tx.send(task).is_err() {
                break;
            }
        }
        drop(tx);
    });
}
