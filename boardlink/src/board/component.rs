//! Peripheral helpers registered against a board.
//!
//! Components (LED drivers, display drivers and similar) are tracked by the
//! board only so they can be cleaned up: on teardown each one is stopped or
//! has its timer cancelled, and its back-reference to the board is dropped.

use std::time::Duration;
use tokio::task::JoinHandle;

use super::io::{Io, PinIo};
use crate::error::Result;
use crate::tracing::prelude::*;

slotmap::new_key_type! {
    /// Key of a component registered with a board.
    pub struct ComponentKey;
}

/// A running interval or timer owned by a component.
#[derive(Debug, Default)]
pub struct ComponentTimer {
    task: Option<JoinHandle<()>>,
}

impl ComponentTimer {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the timer. Returns false if it was already cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

/// A peripheral helper attached to a board.
pub trait Component: Send {
    fn name(&self) -> &str;

    /// Stop the component using its own stop operation.
    ///
    /// Returns `Ok(false)` when the component has no stop operation, in
    /// which case teardown falls back to cancelling its timer.
    fn stop(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// The component's interval or timer, if it tracks one.
    fn timer(&mut self) -> Option<&mut ComponentTimer> {
        None
    }

    /// Drop references to the board and its transport.
    fn detach(&mut self);
}

/// Clean up one component for teardown.
pub(crate) fn release(component: &mut dyn Component) -> Result<()> {
    let stopped = component.stop();
    if !matches!(stopped, Ok(true)) {
        if let Some(timer) = component.timer() {
            timer.cancel();
        }
    }
    component.detach();
    stopped.map(|_| ())
}

/// Blink a digital pin on a fixed period.
pub struct Blink {
    pin: u8,
    io: Option<Io>,
    timer: ComponentTimer,
}

impl Blink {
    /// Start toggling `pin` every `period`.
    pub fn start(io: Io, pin: u8, period: Duration) -> Self {
        let task_io = io.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut level = 0u8;
            loop {
                interval.tick().await;
                level ^= 1;
                if let Err(e) = task_io.digital_write(pin, level).await {
                    debug!(pin, error = %e, "Blink write failed.");
                }
            }
        });
        Self {
            pin,
            io: Some(io),
            timer: ComponentTimer::new(task),
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn is_attached(&self) -> bool {
        self.io.is_some()
    }
}

impl Component for Blink {
    fn name(&self) -> &str {
        "blink"
    }

    fn timer(&mut self) -> Option<&mut ComponentTimer> {
        Some(&mut self.timer)
    }

    fn detach(&mut self) {
        self.io = None;
    }
}
