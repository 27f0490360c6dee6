pub mod attribute;
pub mod config;
pub mod error;
pub mod link;
mod mission;
pub mod modes;
mod param;
pub mod paramfile;
pub mod serial;
mod transport;

pub use attribute::{AttributeStore, AttributeValue, Location, SubscriptionId};
pub use config::LinkConfig;
pub use error::GcsError;
pub use gcs_mission::{MissionFrame, MissionItem, MissionType};
pub use link::{LinkState, ListenerId, MessageCallback, RawCallback};
pub use modes::{available_modes, mode_name, mode_number, vehicle_class, VehicleClass};

use link::{LinkCommand, LinkWorker, MessageListenerRegistry};
use mavlink::ardupilotmega::MavMessage;
use param::ParamSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A single connection to one vehicle: the public handle returned by
/// [`Vehicle::connect`]. Cloning is cheap — clones share the same worker
/// thread and state (§4 "Vehicle" / §9 "one handle per process-wide link").
#[derive(Clone)]
pub struct Vehicle {
    inner: Arc<VehicleInner>,
}

struct VehicleInner {
    attributes: Arc<Mutex<AttributeStore>>,
    listeners: Arc<Mutex<MessageListenerRegistry>>,
    state: Arc<Mutex<LinkState>>,
    exiting: Arc<AtomicBool>,
    commands: mpsc::SyncSender<LinkCommand>,
    params: Arc<Mutex<ParamSet>>,
    target_known: Arc<AtomicBool>,
    local_waypoints: Mutex<Vec<MissionItem>>,
    mission_timeout: Option<Duration>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Vehicle {
    /// Open a connection and start its dedicated event-loop thread. Returns
    /// once the transport is open; when `config.await_params` is set, also
    /// blocks until `wait_ready` reports the parameter set loaded and a GPS
    /// fix type known, up to `config.mission_overall_timeout` (or 30s if
    /// unset).
    pub fn connect(address: &str, config: LinkConfig) -> Result<Self, GcsError> {
        let attributes = Arc::new(Mutex::new(AttributeStore::new()));
        let listeners = Arc::new(Mutex::new(MessageListenerRegistry::default()));
        let state = Arc::new(Mutex::new(LinkState::Connecting));
        let exiting = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::sync_channel(config.command_buffer_size);
        let mission_timeout = config.mission_overall_timeout;
        let await_params = config.await_params;
        let ready_timeout = mission_timeout.unwrap_or(Duration::from_secs(30));
        let params = Arc::new(Mutex::new(ParamSet::new(config.param_watchdog_start, config.param_watchdog_repeat)));
        let target_known = Arc::new(AtomicBool::new(false));

        let worker = LinkWorker::spawn(
            address.to_string(),
            config,
            attributes.clone(),
            listeners.clone(),
            state.clone(),
            exiting.clone(),
            command_rx,
            params.clone(),
            target_known.clone(),
        )
        .map_err(|err| GcsError::ConnectionFailed(err.to_string()))?;

        let vehicle = Self {
            inner: Arc::new(VehicleInner {
                attributes,
                listeners,
                state,
                exiting,
                commands,
                params,
                target_known,
                local_waypoints: Mutex::new(Vec::new()),
                mission_timeout,
                worker: Mutex::new(Some(worker)),
            }),
        };

        if await_params {
            vehicle.wait_ready(ready_timeout)?;
        }

        Ok(vehicle)
    }

    /// Block until the parameter set is fully loaded and a GPS fix type is
    /// known, or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), GcsError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let ready = self.params_loaded() && self.attribute("gps_0").is_some();
            if ready {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(GcsError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.lock().expect("state lock").clone()
    }

    /// Whether the link has received at least one `HEARTBEAT`, and so knows
    /// which `target_system`/`target_component` to address commands to.
    pub fn target_known(&self) -> bool {
        self.inner.target_known.load(Ordering::Relaxed)
    }

    /// Last-known value of a named attribute, or `None` before it has ever
    /// been received (§4.C "Attribute store").
    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.inner.attributes.lock().expect("attr lock").snapshot(name)
    }

    pub fn subscribe<F>(&self, attr: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.attributes.lock().expect("attr lock").subscribe(attr, listener)
    }

    pub fn unsubscribe(&self, attr: &str, id: SubscriptionId) {
        self.inner.attributes.lock().expect("attr lock").unsubscribe(attr, id);
    }

    /// User-triggered re-announcement of already-cached attribute values,
    /// for callers that want a synthetic notification without waiting for
    /// the next inbound message (§4.C).
    pub fn notify_observers(&self, attrs: &[&str]) {
        self.inner.attributes.lock().expect("attr lock").notify(attrs);
    }

    pub fn on_message<F>(&self, name: Option<&str>, callback: F) -> ListenerId
    where
        F: Fn(&MavMessage) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().expect("listener lock").on(name, std::sync::Arc::new(callback))
    }

    pub fn remove_message_listener(&self, name: Option<&str>, id: ListenerId) {
        self.inner.listeners.lock().expect("listener lock").remove(name, id);
    }

    pub fn set_raw_hook<F>(&self, callback: Option<F>)
    where
        F: Fn(&MavMessage) + Send + Sync + 'static,
    {
        let hook = callback.map(|f| Arc::new(f) as RawCallback);
        self.inner.listeners.lock().expect("listener lock").set_raw_hook(hook);
    }

    /// Send a raw message on the link, with `target_system`/`target_component`
    /// rewritten to the vehicle's current target when the message carries
    /// those fields (`COMMAND_LONG`, `COMMAND_INT`, `SET_MODE`).
    pub fn send_message(&self, message: MavMessage) -> Result<(), GcsError> {
        self.inner.commands.send(LinkCommand::Enqueue(message)).map_err(|_| GcsError::Disconnected)
    }

    /// Set a parameter and wait for the vehicle to echo it back (§4.D.4):
    /// sends `PARAM_SET`, then polls the keyed parameter map at 100ms
    /// intervals for up to 1s for a matching value, retrying up to 3 times
    /// before giving up. This is an optimistic acknowledgment — MAVLink's
    /// `PARAM_SET` has no ack distinct from the resulting `PARAM_VALUE` echo.
    pub fn param_set(&self, name: &str, value: f32) -> Result<(), GcsError> {
        if !self.target_known() {
            return Err(GcsError::TargetUnknown);
        }
        let name = name.to_uppercase();
        let mut retries = 3;
        loop {
            self.inner
                .commands
                .send(LinkCommand::ParamSet { name: name.clone(), value })
                .map_err(|_| GcsError::Disconnected)?;

            let deadline = std::time::Instant::now() + Duration::from_secs(1);
            loop {
                if self.param(&name) == Some(value) {
                    return Ok(());
                }
                if std::time::Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            retries -= 1;
            if retries == 0 {
                tracing::warn!(param = %name, "param_set exhausted retries without a matching echo");
                return Err(GcsError::Timeout);
            }
        }
    }

    pub fn param(&self, name: &str) -> Option<f32> {
        self.inner.params.lock().expect("param lock").get(name)
    }

    pub fn params_snapshot(&self) -> HashMap<String, f32> {
        self.inner.params.lock().expect("param lock").snapshot()
    }

    pub fn params_loaded(&self) -> bool {
        self.inner.params.lock().expect("param lock").loaded()
    }

    pub fn set_local_waypoints(&self, items: Vec<MissionItem>) {
        *self.inner.local_waypoints.lock().expect("waypoint lock") = items;
    }

    pub fn local_waypoints(&self) -> Vec<MissionItem> {
        self.inner.local_waypoints.lock().expect("waypoint lock").clone()
    }

    /// Blocking mission download (§4.D.5/6): sends `MISSION_REQUEST_LIST`
    /// and waits for the full item sequence or the configured overall
    /// timeout. On success, also refreshes the local waypoint cache.
    pub fn fetch(&self, mission_type: MissionType) -> Result<Vec<MissionItem>, GcsError> {
        if !self.target_known() {
            return Err(GcsError::TargetUnknown);
        }
        let (reply, rx) = mpsc::channel();
        self.inner
            .commands
            .send(LinkCommand::MissionDownload { mission_type, reply })
            .map_err(|_| GcsError::Disconnected)?;
        let result = self.recv_with_timeout(rx)?;
        if let Ok(items) = &result {
            *self.inner.local_waypoints.lock().expect("waypoint lock") = items.clone();
        }
        result
    }

    /// Blocking mission upload (§4.D.5): uploads the local waypoint cache.
    pub fn send_all_waypoints(&self, mission_type: MissionType) -> Result<(), GcsError> {
        if !self.target_known() {
            return Err(GcsError::TargetUnknown);
        }
        let items = self.local_waypoints();
        let (reply, rx) = mpsc::channel();
        self.inner
            .commands
            .send(LinkCommand::MissionUpload { mission_type, items, reply })
            .map_err(|_| GcsError::Disconnected)?;
        self.recv_with_timeout(rx)?
    }

    fn recv_with_timeout<T>(&self, rx: mpsc::Receiver<T>) -> Result<T, GcsError> {
        match self.inner.mission_timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|_| GcsError::Timeout),
            None => rx.recv().map_err(|_| GcsError::Disconnected),
        }
    }

    /// Signal the worker thread to stop and wait for it to exit.
    pub fn close(&self) {
        let _ = self.inner.commands.send(LinkCommand::Close);
        self.inner.exiting.store(true, Ordering::Relaxed);
        if let Some(handle) = self.inner.worker.lock().expect("worker lock").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VehicleInner {
    fn drop(&mut self) {
        self.exiting.store(true, Ordering::Relaxed);
        let _ = self.commands.send(LinkCommand::Close);
    }
}
