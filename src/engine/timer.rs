use crate::error::{Error, Result};
use log::{debug, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Below this much remaining wait the worker spins instead of blocking on the control channel.
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

pub type Job = Arc<dyn Fn() + Send + Sync>;

/// Seconds as a [`Duration`]. Negative and NaN become zero, anything too large saturates.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}

enum ControlMsg {
    Stop,
}

/// One job at an offset from the start of its plan.
#[derive(Clone)]
pub struct Timer {
    pub offset: Duration,
    pub job: Job,
}

impl Timer {
    pub fn new(offset_seconds: f64, job: Job) -> Self {
        Self {
            offset: seconds_to_duration(offset_seconds),
            job,
        }
    }
}

#[derive(Clone, Default)]
pub struct TimerPlan {
    pub timers: Vec<Timer>,
    /// Repeat the whole plan every `loop_length` until cancelled.
    pub loop_length: Option<Duration>,
    /// Timers before this offset are skipped on the first pass, and the rest are pulled
    /// earlier by the same amount.
    pub start_offset: Duration,
}

impl TimerPlan {
    pub fn once(timers: Vec<Timer>) -> Self {
        Self {
            timers,
            ..Default::default()
        }
    }
}

/// A cancellable batch of timed jobs run on a dedicated worker thread.
///
/// Every [`TimerQueue::schedule`] replaces the previous batch. Each batch is tagged with a
/// generation, and a job only fires while its generation is still current, so nothing from a
/// cancelled or superseded batch can run after [`TimerQueue::cancel`] returns.
#[derive(Debug)]
pub struct TimerQueue {
    name: &'static str,
    generation: Arc<AtomicU64>,
    control_tx: Mutex<Option<Sender<ControlMsg>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: Arc::new(AtomicU64::new(0)),
            control_tx: Mutex::new(None),
            worker_handle: Mutex::new(None),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether a worker is still waiting on timers.
    pub fn is_active(&self) -> bool {
        match self.worker_handle.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Cancels whatever is pending and starts running `plan`, measured from `origin`.
    pub fn schedule(&self, origin: Instant, mut plan: TimerPlan) -> Result<u64> {
        self.cancel()?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if plan.timers.is_empty() {
            return Ok(generation);
        }

        plan.timers.sort_by_key(|timer| timer.offset);

        let (tx, rx) = mpsc::channel::<ControlMsg>();
        let current = Arc::clone(&self.generation);
        let name = self.name;

        let handle = thread::Builder::new()
            .name(format!("{}-timers", name))
            .spawn(move || {
                let sleeper =
                    SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
                let loop_length = plan.loop_length.filter(|len| !len.is_zero());
                let mut cycle_start = -plan.start_offset.as_secs_f64();
                let mut first_cycle = true;

                loop {
                    for timer in plan.timers.iter() {
                        if first_cycle && timer.offset < plan.start_offset {
                            continue;
                        }

                        let at = (cycle_start + timer.offset.as_secs_f64()).max(0.0);
                        let Some(target) = origin.checked_add(seconds_to_duration(at)) else {
                            // Unreachable, and so is everything after it. Hold until cancelled.
                            debug!("Timer worker '{}' parked past the end of time..!", name);
                            let _ = rx.recv();
                            return;
                        };

                        loop {
                            let now = Instant::now();
                            if now >= target {
                                break;
                            }

                            let remaining = target - now;
                            if remaining <= SPIN_THRESHOLD {
                                sleeper.sleep(remaining);
                                break;
                            }

                            match rx.recv_timeout(remaining - SPIN_THRESHOLD) {
                                Ok(ControlMsg::Stop) | Err(RecvTimeoutError::Disconnected) => {
                                    debug!("Timer worker '{}' stopped during wait..!", name);
                                    return;
                                }
                                Err(RecvTimeoutError::Timeout) => {}
                            }
                        }

                        if current.load(Ordering::SeqCst) != generation {
                            debug!("Timer worker '{}' superseded..!", name);
                            return;
                        }

                        (timer.job)();
                    }

                    match loop_length {
                        Some(len) => {
                            cycle_start += len.as_secs_f64();
                            first_cycle = false;
                        }
                        None => break,
                    }
                }

                debug!("Timer worker '{}' finished all timers..!", name);
            })?;

        {
            let Ok(mut ctl) = self.control_tx.lock() else {
                return Err(Error::Lock("control_tx"));
            };
            *ctl = Some(tx);
        }

        let Ok(mut wh) = self.worker_handle.lock() else {
            return Err(Error::Lock("worker_handle"));
        };
        *wh = Some(handle);

        Ok(generation)
    }

    /// Cancels every pending timer and waits for the worker to exit.
    pub fn cancel(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let tx = {
            let Ok(mut lock) = self.control_tx.lock() else {
                return Err(Error::Lock("control_tx"));
            };
            lock.take()
        };

        if let Some(tx) = tx {
            let _ = tx.send(ControlMsg::Stop);
        }

        let handle = {
            let Ok(mut lock) = self.worker_handle.lock() else {
                return Err(Error::Lock("worker_handle"));
            };
            lock.take()
        };

        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // A job cancelled its own queue; the generation bump already stops the loop.
                return Ok(());
            }

            if handle.join().is_err() {
                warn!("Timer worker '{}' panicked..!", self.name);
            }
        }

        Ok(())
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        let _ = self.cancel();
    }
}
