use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::config::Edge;
use crate::error::IrqError;

pub type InterruptCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique handle for an attached callback. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CallbackId(u64);

impl CallbackId {
    fn next() -> Self {
        Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct CallbackEntry {
    pub id: CallbackId,
    pub enabled: bool,
    action: InterruptCallback,
}

pub struct PinConfig {
    pub pin: u32,
    pub edge: Edge,
    pub enabled: bool,
    value_fd: File,
    // ids are monotonic, so key order is registration order
    callbacks: BTreeMap<CallbackId, CallbackEntry>,
}

impl PinConfig {
    pub(crate) fn new(pin: u32, edge: Edge, value_fd: File) -> Self {
        Self {
            pin,
            edge,
            enabled: true,
            value_fd,
            callbacks: BTreeMap::new(),
        }
    }

    pub(crate) fn value_fd(&self) -> &File {
        &self.value_fd
    }

    pub(crate) fn into_value_fd(self) -> File {
        self.value_fd
    }

    /// Callbacks that should run for the next edge, in registration order.
    pub(crate) fn armed_callbacks(&self) -> Vec<(CallbackId, InterruptCallback)> {
        if !self.enabled {
            return Vec::new();
        }
        self.callbacks
            .values()
            .filter(|c| c.enabled)
            .map(|c| (c.id, c.action.clone()))
            .collect()
    }

    fn snapshot(&self) -> PinSnapshot {
        PinSnapshot {
            pin: self.pin,
            edge: self.edge,
            enabled: self.enabled,
            callbacks: self
                .callbacks
                .values()
                .map(|c| CallbackSnapshot {
                    id: c.id,
                    enabled: c.enabled,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackSnapshot {
    pub id: CallbackId,
    pub enabled: bool,
}

/// Immutable view of one configured pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinSnapshot {
    pub pin: u32,
    pub edge: Edge,
    pub enabled: bool,
    pub callbacks: Vec<CallbackSnapshot>,
}

impl PinSnapshot {
    pub fn enabled_callbacks(&self) -> usize {
        self.callbacks.iter().filter(|c| c.enabled).count()
    }
}

/// Outcome of adding a callback to a pin that may not be configured yet.
pub(crate) enum Admission {
    Added(CallbackId),
    NeedsSetup,
}

#[derive(Default)]
pub struct PinRegistry {
    pins: FxHashMap<u32, PinConfig>,
    owners: FxHashMap<CallbackId, u32>,
}

impl PinRegistry {
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn get(&self, pin: u32) -> Option<&PinConfig> {
        self.pins.get(&pin)
    }

    /// Appends to an existing pin with a matching edge. Fails without
    /// mutation if the pin is armed for a different edge.
    pub(crate) fn admit(
        &mut self,
        pin: u32,
        edge: Edge,
        action: &InterruptCallback,
    ) -> Result<Admission, IrqError> {
        let Some(conf) = self.pins.get_mut(&pin) else {
            return Ok(Admission::NeedsSetup);
        };
        if conf.edge != edge {
            return Err(IrqError::Conflict(format!(
                "pin {pin} already watches {:?} edges, cannot watch {edge:?}",
                conf.edge
            )));
        }
        let id = Self::push_callback(conf, action.clone());
        self.owners.insert(id, pin);
        Ok(Admission::Added(id))
    }

    /// Registers a freshly configured pin together with its first callback.
    pub(crate) fn insert(&mut self, mut conf: PinConfig, action: InterruptCallback) -> CallbackId {
        let pin = conf.pin;
        let id = Self::push_callback(&mut conf, action);
        self.owners.insert(id, pin);
        self.pins.insert(pin, conf);
        id
    }

    fn push_callback(conf: &mut PinConfig, action: InterruptCallback) -> CallbackId {
        let id = CallbackId::next();
        conf.callbacks.insert(
            id,
            CallbackEntry {
                id,
                enabled: true,
                action,
            },
        );
        id
    }

    pub fn set_callback_enabled(&mut self, id: CallbackId, enabled: bool) -> Result<(), IrqError> {
        let entry = self
            .owners
            .get(&id)
            .and_then(|pin| self.pins.get_mut(pin))
            .and_then(|conf| conf.callbacks.get_mut(&id))
            .ok_or_else(|| IrqError::NotFound(format!("callback {id}")))?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn set_pin_enabled(&mut self, pin: u32, enabled: bool) -> Result<(), IrqError> {
        let conf = self
            .pins
            .get_mut(&pin)
            .ok_or_else(|| IrqError::NotFound(format!("pin {pin}")))?;
        conf.enabled = enabled;
        Ok(())
    }

    /// Removes one callback. When it was the last one on its pin the pin entry
    /// is detached as well and handed back for teardown.
    pub(crate) fn remove_callback(&mut self, id: CallbackId) -> Result<Option<PinConfig>, IrqError> {
        let pin = self
            .owners
            .remove(&id)
            .ok_or_else(|| IrqError::NotFound(format!("callback {id}")))?;
        let Some(conf) = self.pins.get_mut(&pin) else {
            return Ok(None);
        };
        conf.callbacks.remove(&id);
        if conf.callbacks.is_empty() {
            Ok(self.pins.remove(&pin))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn remove_pin(&mut self, pin: u32) -> Result<PinConfig, IrqError> {
        let conf = self
            .pins
            .remove(&pin)
            .ok_or_else(|| IrqError::NotFound(format!("pin {pin}")))?;
        for id in conf.callbacks.keys() {
            self.owners.remove(id);
        }
        Ok(conf)
    }

    pub(crate) fn drain(&mut self) -> Vec<PinConfig> {
        self.owners.clear();
        let mut pins: Vec<_> = self.pins.drain().map(|(_, conf)| conf).collect();
        pins.sort_by_key(|c| c.pin);
        pins
    }

    /// Snapshot of every configured pin, ordered by pin number.
    pub fn snapshot(&self) -> Vec<PinSnapshot> {
        let mut pins: Vec<_> = self.pins.values().map(PinConfig::snapshot).collect();
        pins.sort_by_key(|p| p.pin);
        pins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn dummy_fd() -> File {
        File::open("/dev/null").expect("open /dev/null")
    }

    fn counter() -> (Arc<AtomicUsize>, InterruptCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let cb: InterruptCallback = Arc::new(move || {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        (hits, cb)
    }

    fn registry_with_pin(pin: u32, edge: Edge) -> (PinRegistry, CallbackId) {
        let mut registry = PinRegistry::default();
        let (_, cb) = counter();
        let id = registry.insert(PinConfig::new(pin, edge, dummy_fd()), cb);
        (registry, id)
    }

    #[test]
    fn callback_ids_are_unique_and_increasing() {
        let a = CallbackId::next();
        let b = CallbackId::next();
        assert!(b > a);
        assert_ne!(a, b);
    }

    #[test]
    fn admit_without_pin_requests_setup() {
        let mut registry = PinRegistry::default();
        let (_, cb) = counter();
        assert!(matches!(
            registry.admit(8, Edge::Falling, &cb),
            Ok(Admission::NeedsSetup)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn admit_fans_out_on_matching_edge() {
        let (mut registry, first) = registry_with_pin(8, Edge::Falling);
        let (_, cb) = counter();

        let Ok(Admission::Added(second)) = registry.admit(8, Edge::Falling, &cb) else {
            panic!("expected callback to be added");
        };
        assert!(second > first);

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        let ids: Vec<_> = snap[0].callbacks.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn admit_rejects_edge_mismatch_without_mutation() {
        let (mut registry, _) = registry_with_pin(8, Edge::Falling);
        let (_, cb) = counter();

        let err = registry.admit(8, Edge::Rising, &cb).err().unwrap();
        assert!(err.is_conflict());
        assert_eq!(registry.snapshot()[0].callbacks.len(), 1);
        assert_eq!(registry.snapshot()[0].edge, Edge::Falling);
    }

    #[test]
    fn disabled_callbacks_are_not_armed() {
        let (mut registry, first) = registry_with_pin(8, Edge::Both);
        let (_, cb) = counter();
        let Ok(Admission::Added(second)) = registry.admit(8, Edge::Both, &cb) else {
            panic!("expected callback to be added");
        };

        registry.set_callback_enabled(first, false).unwrap();
        let armed: Vec<_> = registry
            .get(8)
            .unwrap()
            .armed_callbacks()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(armed, vec![second]);

        registry.set_pin_enabled(8, false).unwrap();
        assert!(registry.get(8).unwrap().armed_callbacks().is_empty());
        assert_eq!(registry.snapshot()[0].enabled_callbacks(), 1);
    }

    #[test]
    fn unknown_ids_and_pins_are_not_found() {
        let mut registry = PinRegistry::default();
        let stray = CallbackId::next();

        assert!(registry.set_callback_enabled(stray, true).unwrap_err().is_not_found());
        assert!(registry.remove_callback(stray).err().unwrap().is_not_found());
        assert!(registry.set_pin_enabled(3, true).unwrap_err().is_not_found());
        assert!(registry.remove_pin(3).err().unwrap().is_not_found());
    }

    #[test]
    fn removing_last_callback_detaches_pin() {
        let (mut registry, first) = registry_with_pin(8, Edge::Rising);
        let (_, cb) = counter();
        let Ok(Admission::Added(second)) = registry.admit(8, Edge::Rising, &cb) else {
            panic!("expected callback to be added");
        };

        assert!(registry.remove_callback(first).unwrap().is_none());
        assert_eq!(registry.len(), 1);

        let detached = registry.remove_callback(second).unwrap();
        assert_eq!(detached.map(|c| c.pin), Some(8));
        assert!(registry.is_empty());
        assert!(registry.remove_callback(second).err().unwrap().is_not_found());
    }

    #[test]
    fn remove_pin_forgets_its_callback_ids() {
        let (mut registry, id) = registry_with_pin(5, Edge::Both);

        let conf = registry.remove_pin(5).unwrap();
        assert_eq!(conf.pin, 5);
        assert!(registry.set_callback_enabled(id, false).unwrap_err().is_not_found());
    }

    #[test]
    fn armed_callbacks_run_in_registration_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = PinRegistry::default();
        let o1 = order.clone();
        registry.insert(
            PinConfig::new(2, Edge::Both, dummy_fd()),
            Arc::new(move || o1.lock().push(1)),
        );
        for tag in 2..=4 {
            let o = order.clone();
            let cb: InterruptCallback = Arc::new(move || o.lock().push(tag));
            registry.admit(2, Edge::Both, &cb).unwrap();
        }

        for (_, action) in registry.get(2).unwrap().armed_callbacks() {
            action();
        }
        assert_eq!(*order.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn drain_returns_pins_sorted() {
        let mut registry = PinRegistry::default();
        for pin in [9, 3, 6] {
            let (_, cb) = counter();
            registry.insert(PinConfig::new(pin, Edge::Rising, dummy_fd()), cb);
        }
        let pins: Vec<_> = registry.drain().iter().map(|c| c.pin).collect();
        assert_eq!(pins, vec![3, 6, 9]);
        assert!(registry.is_empty());
    }
}
