//! Periodic pulse generator.
//!
//! A [`Clock`] owns one worker thread that calls
//! [`ClockDriven::clock_pulse`] on its target at a configured rate. All
//! control operations are commands sent to that worker, so the schedule has a
//! single owner.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use log::{debug, trace, warn};

/// Something advanced one step per clock pulse.
pub trait ClockDriven: Send {
    fn clock_pulse(&mut self);
}

enum ClockCommand {
    Go,
    Pause,
    Rate(f64),
    Interrupt,
    Terminate,
}

/// Cloneable handle to a running clock.
///
/// Targets can keep one to adjust their own rate (fast forward) from inside
/// a pulse.
#[derive(Clone)]
pub struct ClockControl {
    tx: cb::Sender<ClockCommand>,
    running: Arc<AtomicBool>,
    rate_bits: Arc<AtomicU64>,
    terminated: Arc<AtomicBool>,
}

impl ClockControl {
    pub fn go(&self) {
        if self.terminated.load(Ordering::Acquire) {
            warn!("Clock: go requested after terminate");
            return;
        }
        self.running.store(true, Ordering::Release);
        let _ = self.tx.send(ClockCommand::Go);
    }

    pub fn pause(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.tx.send(ClockCommand::Pause);
    }

    /// Pulses per second. Zero or negative means on-demand: the target is
    /// pulsed only when the clock is interrupted.
    pub fn set_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
        let _ = self.tx.send(ClockCommand::Rate(rate));
    }

    /// Wake the worker and pulse the target once, out of schedule.
    pub fn interrupt(&self) {
        let _ = self.tx.send(ClockCommand::Interrupt);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

pub struct Clock {
    name: String,
    control: ClockControl,
    worker: Option<JoinHandle<()>>,
}

impl Clock {
    /// Spawns the worker thread. The clock starts paused.
    pub fn spawn<T>(name: &str, target: Arc<Mutex<T>>, rate: f64) -> io::Result<Self>
    where
        T: ClockDriven + 'static,
    {
        let (tx, rx) = cb::unbounded();
        let control = ClockControl {
            tx,
            running: Arc::new(AtomicBool::new(false)),
            rate_bits: Arc::new(AtomicU64::new(rate.to_bits())),
            terminated: Arc::new(AtomicBool::new(false)),
        };

        let thread_name = name.to_string();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || clock_thread_main(&thread_name, rx, target, rate))?;

        debug!("Clock: {name} spawned at {rate} Hz");
        Ok(Self {
            name: name.to_string(),
            control,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> ClockControl {
        self.control.clone()
    }

    pub fn go(&self) {
        self.control.go();
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn set_rate(&self, rate: f64) {
        self.control.set_rate(rate);
    }

    pub fn interrupt(&self) {
        self.control.interrupt();
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn rate(&self) -> f64 {
        self.control.rate()
    }

    /// Stops the worker for good and waits for it to exit.
    pub fn terminate(&mut self) {
        self.control.terminated.store(true, Ordering::Release);
        self.control.running.store(false, Ordering::Release);
        let _ = self.control.tx.send(ClockCommand::Terminate);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Clock: {} worker panicked", self.name);
            }
            debug!("Clock: {} terminated", self.name);
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Longest period a positive rate maps to; slower rates are clamped.
const MAX_PERIOD: Duration = Duration::from_secs(3600);

fn period_for(rate: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / rate).map_or(MAX_PERIOD, |period| period.min(MAX_PERIOD))
}

fn pulse<T: ClockDriven>(target: &Arc<Mutex<T>>) {
    if let Ok(mut t) = target.lock() {
        t.clock_pulse();
    }
}

fn clock_thread_main<T: ClockDriven>(
    name: &str,
    rx: cb::Receiver<ClockCommand>,
    target: Arc<Mutex<T>>,
    mut rate: f64,
) {
    let mut running = false;
    let mut next_pulse: Option<Instant> = None;

    loop {
        let command = if running && rate > 0.0 {
            let deadline = *next_pulse.get_or_insert_with(|| Instant::now() + period_for(rate));
            match rx.recv_deadline(deadline) {
                Ok(cmd) => Some(cmd),
                Err(cb::RecvTimeoutError::Timeout) => None,
                Err(cb::RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            }
        };

        match command {
            None => {
                pulse(&target);
                let period = period_for(rate);
                let now = Instant::now();
                let mut next = next_pulse.unwrap_or(now) + period;
                // Too far behind: rebase instead of replaying missed pulses.
                if next + period < now {
                    trace!("Clock: {name} late, rebasing schedule");
                    next = now + period;
                }
                next_pulse = Some(next);
            }
            Some(ClockCommand::Go) => {
                if !running {
                    running = true;
                    next_pulse = None;
                }
            }
            Some(ClockCommand::Pause) => {
                running = false;
                next_pulse = None;
            }
            Some(ClockCommand::Rate(new_rate)) => {
                rate = new_rate;
                next_pulse = None;
            }
            Some(ClockCommand::Interrupt) => pulse(&target),
            Some(ClockCommand::Terminate) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        pulses: u32,
    }

    impl ClockDriven for Counter {
        fn clock_pulse(&mut self) {
            self.pulses += 1;
        }
    }

    fn pulses(target: &Arc<Mutex<Counter>>) -> u32 {
        target.lock().expect("counter lock").pulses
    }

    #[test]
    fn paused_clock_does_not_pulse() {
        let target = Arc::new(Mutex::new(Counter::default()));
        let mut clock = Clock::spawn("test paused", Arc::clone(&target), 200.0).expect("spawn");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pulses(&target), 0);
        assert!(!clock.is_running());
        clock.terminate();
    }

    #[test]
    fn running_clock_pulses_at_rate() {
        let target = Arc::new(Mutex::new(Counter::default()));
        let mut clock = Clock::spawn("test rate", Arc::clone(&target), 200.0).expect("spawn");
        clock.go();
        thread::sleep(Duration::from_millis(200));
        clock.pause();
        thread::sleep(Duration::from_millis(20));
        let count = pulses(&target);
        assert!(count >= 10, "expected steady pulses, got {count}");
        assert!(count <= 60, "clock ran too fast: {count}");

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pulses(&target), count, "paused clock must not pulse");
        clock.terminate();
    }

    #[test]
    fn on_demand_clock_pulses_only_when_interrupted() {
        let target = Arc::new(Mutex::new(Counter::default()));
        let mut clock = Clock::spawn("test on-demand", Arc::clone(&target), 0.0).expect("spawn");
        clock.go();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(pulses(&target), 0);

        clock.interrupt();
        clock.interrupt();
        // Terminate is queued behind the interrupts, so both pulses land first.
        clock.terminate();
        assert_eq!(pulses(&target), 2);
    }

    #[test]
    fn set_rate_updates_handle() {
        let target = Arc::new(Mutex::new(Counter::default()));
        let clock = Clock::spawn("test set rate", target, 60.0).expect("spawn");
        let control = clock.control();
        control.set_rate(240.0);
        assert_eq!(clock.rate(), 240.0);
        assert_eq!(clock.name(), "test set rate");
    }

    #[test]
    fn tiny_rate_is_clamped_instead_of_killing_the_worker() {
        let target = Arc::new(Mutex::new(Counter::default()));
        let mut clock = Clock::spawn("test tiny rate", Arc::clone(&target), 60.0).expect("spawn");
        clock.go();
        clock.control().set_rate(1e-300);
        thread::sleep(Duration::from_millis(30));
        let before = pulses(&target);

        clock.interrupt();
        clock.terminate();
        assert_eq!(pulses(&target), before + 1, "worker must still serve commands");
        assert_eq!(period_for(1e-300), MAX_PERIOD);
    }

    #[test]
    fn terminate_is_final() {
        let target = Arc::new(Mutex::new(Counter::default()));
        let mut clock = Clock::spawn("test terminate", Arc::clone(&target), 500.0).expect("spawn");
        clock.go();
        clock.terminate();
        let after = pulses(&target);
        let control = clock.control();
        assert!(control.is_terminated());
        control.go();
        control.interrupt();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(pulses(&target), after);
        assert!(!clock.is_running());
    }
}
