//! Background execution of a [`Machine`]
//!
//! The machine sits behind one mutex shared by the worker thread and the
//! front end. The worker takes it for one scheduler slice at a time, so
//! input and inspection from the front end land between slices. Run state
//! changes go through a second small mutex with a condition variable. The
//! worker checks it between slices, and sleeps on it while paused and
//! between paced frames.

use crate::keyboard::Key;
use crate::machine::Machine;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use xtemu_core::logging::{log, LogCategory, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    /// Stopped by the front end or because the machine stopped
    Stopped,
}

struct Control {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl Control {
    fn new(state: RunState) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: RunState) {
        let mut current = self.lock();
        // a stopped runner stays stopped
        if *current != RunState::Stopped {
            *current = state;
        }
        self.changed.notify_all();
    }
}

pub struct MachineRunner {
    machine: Arc<Mutex<Machine>>,
    control: Arc<Control>,
    worker: Option<JoinHandle<()>>,
}

impl MachineRunner {
    /// Wrap `machine` without starting it.
    pub fn new(machine: Machine) -> Self {
        Self {
            machine: Arc::new(Mutex::new(machine)),
            control: Arc::new(Control::new(RunState::Paused)),
            worker: None,
        }
    }

    /// Start the worker thread, or resume it if it is paused.
    pub fn run(&mut self) {
        if self.worker.is_some() {
            self.resume();
            return;
        }
        self.control.set(RunState::Running);

        let machine = Arc::clone(&self.machine);
        let control = Arc::clone(&self.control);
        self.worker = Some(thread::spawn(move || worker_loop(&machine, &control)));
    }

    pub fn pause(&self) {
        self.control.set(RunState::Paused);
    }

    pub fn resume(&self) {
        self.control.set(RunState::Running);
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&mut self) {
        {
            let mut state = self.control.lock();
            *state = RunState::Stopped;
            self.control.changed.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log(LogCategory::CPU, LogLevel::Error, || {
                    "emulation thread panicked".to_string()
                });
            }
        }
    }

    pub fn state(&self) -> RunState {
        *self.control.lock()
    }

    /// Block until the runner stops or `timeout` passes. Returns whether it
    /// stopped.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let state = self.control.lock();
        let (state, _) = self
            .control
            .changed
            .wait_timeout_while(state, timeout, |s| *s != RunState::Stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *state == RunState::Stopped
    }

    /// Run `f` with exclusive access to the machine.
    pub fn with_machine<R>(&self, f: impl FnOnce(&mut Machine) -> R) -> R {
        f(&mut lock_machine(&self.machine))
    }

    pub fn key_down(&self, key: Key) {
        self.with_machine(|m| m.key_down(key));
    }

    pub fn key_up(&self, key: Key) {
        self.with_machine(|m| m.key_up(key));
    }

    pub fn set_mouse(&self, x: u16, y: u16, buttons: u16) {
        self.with_machine(|m| m.set_mouse(x, y, buttons));
    }
}

impl Drop for MachineRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_machine(machine: &Mutex<Machine>) -> MutexGuard<'_, Machine> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a call to [`run_frame`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameEnd {
    Completed,
    /// The runner left the running state between two slices
    Interrupted,
    /// The machine exited or faulted
    MachineStopped,
}

/// Run slices until `frame_us` of simulated time have passed. The machine
/// lock is held for one slice at a time.
fn run_frame(machine: &Mutex<Machine>, control: &Control, frame_us: f64) -> FrameEnd {
    let target = lock_machine(machine).elapsed_us() + frame_us;
    loop {
        if *control.lock() != RunState::Running {
            return FrameEnd::Interrupted;
        }
        let mut m = lock_machine(machine);
        m.run_slice();
        if !m.is_running() {
            return FrameEnd::MachineStopped;
        }
        if m.elapsed_us() >= target {
            return FrameEnd::Completed;
        }
    }
}

fn worker_loop(machine: &Mutex<Machine>, control: &Control) {
    let (frame_rate, max_slice_us) = {
        let m = lock_machine(machine);
        (m.config().frame_rate, m.config().max_slice_us)
    };
    let frame_us = if frame_rate == 0 {
        max_slice_us
    } else {
        1_000_000.0 / frame_rate as f64
    };

    loop {
        {
            let state = control.lock();
            let state = control
                .changed
                .wait_while(state, |s| *s == RunState::Paused)
                .unwrap_or_else(PoisonError::into_inner);
            if *state == RunState::Stopped {
                return;
            }
        }

        let started = Instant::now();
        match run_frame(machine, control, frame_us) {
            FrameEnd::Completed => {}
            FrameEnd::Interrupted => continue,
            FrameEnd::MachineStopped => {
                log(LogCategory::CPU, LogLevel::Info, || {
                    "machine stopped, emulation thread exiting".to_string()
                });
                let mut state = control.lock();
                *state = RunState::Stopped;
                control.changed.notify_all();
                return;
            }
        }

        // keep to real time, waking early for state changes
        if frame_rate != 0 {
            let frame = Duration::from_secs_f64(frame_us / 1_000_000.0);
            let remaining = frame.saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                let state = control.lock();
                let _ = control
                    .changed
                    .wait_timeout_while(state, remaining, |s| *s == RunState::Running);
            }
        }
    }
}
