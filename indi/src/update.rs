//! Outbound property updates
//!
//! Local code stages desired values on one or more properties through a
//! [`Staging`] guard, then commits: every touched property becomes exactly one
//! `new*Vector` message. Messages go through a single bounded FIFO queue to
//! the connection's writer task, so sends from one caller reach the server in
//! issue order. Queueing never blocks: when a stalled socket has let the queue
//! fill up, the send fails with `QueueFull` and nothing is queued.
//! Confirmation only ever arrives as a later server push.

use std::sync::{Arc, Mutex, PoisonError, RwLockWriteGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::devices::DeviceContext;
use crate::error::{IndiError, IndiResult};
use crate::model::{write_store, DeviceStore, StagedVector, Value};
use crate::protocol;

/// Handle on the writer queue of the current connection
#[derive(Debug, Clone, Default)]
pub struct PropertyUpdater {
    tx: Arc<Mutex<Option<mpsc::Sender<String>>>>,
}

impl PropertyUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, tx: mpsc::Sender<String>) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub(crate) fn detach(&self) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Queue a raw protocol message.
    pub fn send_raw(&self, xml: String) -> IndiResult<()> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(IndiError::NotConnected)?;
        tx.try_send(xml).map_err(|e| match e {
            TrySendError::Full(_) => IndiError::QueueFull(tx.max_capacity()),
            TrySendError::Closed(_) => IndiError::ChannelClosed("INDI writer task has stopped".to_string()),
        })
    }

    /// Queue one `new*Vector` for the staged values.
    pub fn send(&self, staged: &StagedVector) -> IndiResult<()> {
        tracing::debug!(
            "Sending {} value(s) for {}.{}",
            staged.values.len(),
            staged.device,
            staged.property
        );
        self.send_raw(protocol::new_vector(staged))
    }
}

/// Exclusive staging session on one device.
///
/// Holds the model's write lock until committed or dropped. Dropping without
/// committing rolls back every desired value staged through it.
pub struct Staging<'a> {
    ctx: &'a DeviceContext,
    store: RwLockWriteGuard<'a, DeviceStore>,
    device: String,
    touched: Vec<String>,
}

impl<'a> Staging<'a> {
    /// Fails with `DeviceGone` when the device is not in the model.
    pub(crate) fn begin(ctx: &'a DeviceContext, device: &str) -> IndiResult<Self> {
        let store = write_store(&ctx.store);
        if store.device(device).is_none() {
            return Err(IndiError::DeviceGone(device.to_string()));
        }
        Ok(Self {
            ctx,
            store,
            device: device.to_string(),
            touched: Vec::new(),
        })
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    /// `Unsupported` unless `property` exists with all of `elements`.
    pub fn require(&self, property: &str, elements: &[&str], operation: &str) -> IndiResult<()> {
        match self.store.property(&self.device, property) {
            Some(p) if p.has_elements(elements) => Ok(()),
            _ => Err(IndiError::unsupported(&self.device, operation)),
        }
    }

    pub fn set(&mut self, property: &str, element: &str, value: Value) -> IndiResult<&mut Self> {
        self.store.set_desired_value(&self.device, property, element, value)?;
        self.touch(property);
        Ok(self)
    }

    /// Like [`require`](Self::require) but as a plain check
    pub fn supports(&self, property: &str, elements: &[&str]) -> bool {
        self.store
            .property(&self.device, property)
            .map(|p| p.has_elements(elements))
            .unwrap_or(false)
    }

    /// One-of-many: `element` On, the rest Off
    pub fn select(&mut self, property: &str, element: &str) -> IndiResult<&mut Self> {
        self.store.select_switch(&self.device, property, element)?;
        self.touch(property);
        Ok(self)
    }

    fn touch(&mut self, property: &str) {
        if !self.touched.iter().any(|p| p == property) {
            self.touched.push(property.to_string());
        }
    }

    /// Send one message per touched property, in staging order.
    ///
    /// Staged values are cleared whether or not the queueing succeeds.
    pub fn commit(mut self) -> IndiResult<()> {
        let mut batch = Vec::with_capacity(self.touched.len());
        for property in &self.touched {
            if let Some(staged) = self.store.take_staged(&self.device, property)? {
                batch.push(staged);
            }
        }
        self.touched.clear();
        let ctx = self.ctx;
        drop(self);

        for staged in &batch {
            if let Err(e) = ctx.updater.send(staged) {
                ctx.log(format!("Error: {}", e), Some(&staged.device));
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        for property in &self.touched {
            self.store.discard_staged(&self.device, property);
        }
    }
}
