//! Uniform close capability for owned connection handles.
//!
//! Listeners, transports and bus clients all expose different ways of
//! shutting down. Each is wrapped in a [`Closeable`] and parked in an
//! [`OwnedHandles`] slot, so teardown can walk one list and attempt every
//! close exactly once regardless of earlier failures.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Upper bound on a single close step so teardown cannot hang the host.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Something a connection owns and must release on teardown.
#[async_trait]
pub trait Closeable: Send {
    /// Short label used in logs.
    fn label(&self) -> &'static str;

    /// Release the underlying resource.
    ///
    /// Called at most once by [`OwnedHandles`].
    async fn close(&mut self) -> Result<()>;
}

/// Teardown stage an owned handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum CloseSlot {
    Listener,
    Transport,
    Bus,
}

/// Owned handles of one connection, closed in stage order.
#[derive(Default)]
pub struct OwnedHandles {
    listener: Option<Box<dyn Closeable>>,
    transport: Option<Box<dyn Closeable>>,
    bus: Option<Box<dyn Closeable>>,
}

impl OwnedHandles {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, slot: CloseSlot) -> &mut Option<Box<dyn Closeable>> {
        match slot {
            CloseSlot::Listener => &mut self.listener,
            CloseSlot::Transport => &mut self.transport,
            CloseSlot::Bus => &mut self.bus,
        }
    }

    /// Take ownership of a handle.
    ///
    /// Returns the handle previously parked in the same slot, if any; the
    /// caller is responsible for closing it.
    pub fn put(
        &mut self,
        slot: CloseSlot,
        handle: Box<dyn Closeable>,
    ) -> Option<Box<dyn Closeable>> {
        self.slot_mut(slot).replace(handle)
    }

    pub fn is_held(&self, slot: CloseSlot) -> bool {
        match slot {
            CloseSlot::Listener => self.listener.is_some(),
            CloseSlot::Transport => self.transport.is_some(),
            CloseSlot::Bus => self.bus.is_some(),
        }
    }

    /// Close the handle held in one slot, if any.
    ///
    /// The handle is removed first, so it is never closed twice.
    pub async fn close(&mut self, slot: CloseSlot) -> Result<()> {
        let Some(mut handle) = self.slot_mut(slot).take() else {
            return Ok(());
        };
        let label = handle.label();
        match time::timeout(CLOSE_TIMEOUT, handle.close()).await {
            Ok(Ok(())) => {
                debug!(slot = %slot, handle = label, "Closed.");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(slot = %slot, handle = label, error = %e, "Close failed.");
                Err(e)
            }
            Err(_) => {
                warn!(slot = %slot, handle = label, "Close timed out.");
                Err(Error::Teardown(format!("{} close timed out", label)))
            }
        }
    }

    /// Close every held handle in listener, transport, bus order.
    ///
    /// Failures and timeouts are logged and collected; they never stop the
    /// remaining handles from being closed. A second call closes nothing.
    pub async fn close_all(&mut self) -> Vec<Error> {
        use strum::IntoEnumIterator;

        let mut failures = Vec::new();
        for slot in CloseSlot::iter() {
            if let Err(e) = self.close(slot).await {
                failures.push(e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Probe {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Closeable for Probe {
        fn label(&self) -> &'static str {
            self.label
        }

        async fn close(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                Err(Error::Teardown("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn probe(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Box<Probe> {
        Box::new(Probe {
            label,
            log: log.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn closes_in_stage_order_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut owned = OwnedHandles::new();
        owned.put(CloseSlot::Bus, probe("bus", &log, false));
        owned.put(CloseSlot::Transport, probe("socket", &log, false));
        owned.put(CloseSlot::Listener, probe("server", &log, true));

        let failures = owned.close_all().await;

        assert_eq!(*log.lock().unwrap(), vec!["server", "socket", "bus"]);
        assert_eq!(failures.len(), 1);
        assert!(!owned.is_held(CloseSlot::Bus));
    }

    #[tokio::test]
    async fn second_close_is_a_no_op() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut owned = OwnedHandles::new();
        owned.put(CloseSlot::Transport, probe("socket", &log, false));

        assert!(owned.close_all().await.is_empty());
        assert!(owned.close_all().await.is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closing_one_slot_leaves_the_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut owned = OwnedHandles::new();
        owned.put(CloseSlot::Listener, probe("server", &log, false));
        owned.put(CloseSlot::Transport, probe("socket", &log, true));

        assert!(owned.close(CloseSlot::Transport).await.is_err());
        assert!(owned.close(CloseSlot::Transport).await.is_ok());
        assert!(owned.is_held(CloseSlot::Listener));
        assert!(!owned.is_held(CloseSlot::Transport));

        assert!(owned.close_all().await.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["socket", "server"]);
    }

    #[tokio::test]
    async fn put_returns_displaced_handle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut owned = OwnedHandles::new();
        assert!(owned.put(CloseSlot::Listener, probe("a", &log, false)).is_none());
        let displaced = owned.put(CloseSlot::Listener, probe("b", &log, false));
        assert_eq!(displaced.map(|h| h.label()), Some("a"));
    }
}
