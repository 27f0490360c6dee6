use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Merged position/attitude snapshot behind the `location` attribute.
/// `GLOBAL_POSITION_INT` owns `lat`/`lon`; `VFR_HUD` owns `heading_deg`/`alt`
/// (bit-preserved, not rescaled — see the testable-properties notes). Each
/// message updates only the fields it owns and preserves the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub heading_deg: Option<f32>,
    pub alt: Option<f32>,
}

/// One of the small structured values the link manager caches per attribute name.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Location(Location),
    Velocity {
        vx: f64,
        vy: f64,
        vz: f64,
    },
    LocalPosition {
        north: f32,
        east: f32,
        down: f32,
    },
    Gps0 {
        eph: u16,
        epv: u16,
        satellites_visible: u8,
        fix_type: u8,
    },
    Airspeed(f32),
    Groundspeed(f32),
    Attitude {
        pitch: f32,
        yaw: f32,
        roll: f32,
        pitchspeed: f32,
        yawspeed: f32,
        rollspeed: f32,
    },
    Battery {
        voltage: f32,
        current: Option<f32>,
        level: i8,
    },
    Mode(String),
    Armed(bool),
    Mount {
        pitch: f32,
        roll: f32,
        yaw: f32,
    },
    Rangefinder {
        distance: f32,
        voltage: f32,
    },
    EkfOk(bool),
    Rc(HashMap<String, u16>),
    CurrentWaypoint(u16),
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Typed cache of last-known vehicle state plus per-attribute observer lists.
///
/// Owned exclusively by the link manager worker. `set` never notifies by
/// itself; callers batch related writes and call `notify` once so a single
/// inbound message can announce several attributes atomically.
#[derive(Default)]
pub struct AttributeStore {
    values: HashMap<String, AttributeValue>,
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_id: std::sync::atomic::AtomicU64,
}

/// Opaque handle returned by `subscribe`, needed to `unsubscribe` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, attr: &str, value: AttributeValue) {
        self.values.insert(attr.to_string(), value);
    }

    pub fn snapshot(&self, attr: &str) -> Option<AttributeValue> {
        self.values.get(attr).cloned()
    }

    pub fn subscribe<F>(&self, attr: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("attribute listener lock")
            .entry(attr.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, attr: &str, id: SubscriptionId) {
        if let Some(list) = self
            .listeners
            .lock()
            .expect("attribute listener lock")
            .get_mut(attr)
        {
            list.retain(|(existing, _)| *existing != id.0);
        }
    }

    /// Invoke every listener registered for each named attribute, in
    /// registration order, in the order the attributes are listed. The
    /// listener list is snapshotted first so registering/unregistering from
    /// within a callback cannot corrupt this pass.
    pub fn notify(&self, attrs: &[&str]) {
        for attr in attrs {
            let snapshot: Vec<Listener> = {
                let guard = self.listeners.lock().expect("attribute listener lock");
                guard
                    .get(*attr)
                    .map(|list| list.iter().map(|(_, f)| f.clone()).collect())
                    .unwrap_or_default()
            };
            for listener in snapshot {
                let attr_name = *attr;
                let result = catch_unwind(AssertUnwindSafe(|| listener(attr_name)));
                if result.is_err() {
                    tracing::warn!(attribute = attr_name, "attribute listener panicked; skipped");
                }
            }
        }
    }
}
