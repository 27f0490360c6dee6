use crate::attribute::{AttributeStore, AttributeValue, Location};
use crate::config::LinkConfig;
use crate::mission::{DownloadAction, MissionDownload, MissionUpload};
use crate::modes;
use crate::param::ParamSet;
use crate::transport::{IoOutcome, MavlinkTransport};
use crate::GcsError;
use gcs_mission::{MissionFrame, MissionItem, MissionType};
use mavlink::ardupilotmega::{self as dialect, MavMessage};
use mavlink::MavHeader;
use num_traits::FromPrimitive;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

pub type MessageCallback = Arc<dyn Fn(&MavMessage) + Send + Sync>;
pub type RawCallback = Arc<dyn Fn(&MavMessage) + Send + Sync>;

/// Two-table listener registry (§6 "Dynamic per-message dispatch"): a
/// per-type-name table plus a wildcard list. String keys live only at this
/// registration boundary; dispatch itself matches the decoded `MavMessage`.
#[derive(Default)]
pub struct MessageListenerRegistry {
    typed: HashMap<String, Vec<(u64, MessageCallback)>>,
    wildcard: Vec<(u64, MessageCallback)>,
    raw_hook: Option<RawCallback>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

impl MessageListenerRegistry {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn on(&mut self, name: Option<&str>, callback: MessageCallback) -> ListenerId {
        let id = self.next();
        match name {
            Some(name) => self.typed.entry(name.to_string()).or_default().push((id, callback)),
            None => self.wildcard.push((id, callback)),
        }
        ListenerId(id)
    }

    pub fn remove(&mut self, name: Option<&str>, id: ListenerId) {
        match name {
            Some(name) => {
                if let Some(list) = self.typed.get_mut(name) {
                    list.retain(|(existing, _)| *existing != id.0);
                }
            }
            None => self.wildcard.retain(|(existing, _)| *existing != id.0),
        }
    }

    pub fn set_raw_hook(&mut self, callback: Option<RawCallback>) {
        self.raw_hook = callback;
    }

    /// Dispatch pipeline's last step: typed listeners in registration order,
    /// then wildcard listeners, then the single raw hook. The lists are
    /// snapshotted by the caller before this runs.
    fn dispatch(&self, name: &str, message: &MavMessage) {
        let typed: Vec<MessageCallback> = self
            .typed
            .get(name)
            .map(|list| list.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default();
        for callback in typed {
            callback(message);
        }
        let wildcard: Vec<MessageCallback> = self.wildcard.iter().map(|(_, f)| f.clone()).collect();
        for callback in wildcard {
            callback(message);
        }
        if let Some(hook) = &self.raw_hook {
            hook(message);
        }
    }
}

pub(crate) enum LinkCommand {
    Enqueue(MavMessage),
    ParamSet {
        name: String,
        value: f32,
    },
    MissionUpload {
        mission_type: MissionType,
        items: Vec<MissionItem>,
        reply: mpsc::Sender<Result<(), GcsError>>,
    },
    MissionDownload {
        mission_type: MissionType,
        reply: mpsc::Sender<Result<Vec<MissionItem>, GcsError>>,
    },
    Close,
}

fn message_name(message: &MavMessage) -> String {
    // `MavMessage`'s variant name doubles as the MAVLink message name; the
    // mavlink crate's `Message` trait exposes it directly off the message.
    use mavlink::Message;
    message.message_name().to_string()
}

fn pad_param_id(id: &str) -> [char; 16] {
    let mut out = ['\0'; 16];
    for (slot, ch) in out.iter_mut().zip(id.chars()) {
        *slot = ch;
    }
    out
}

fn param_id_to_string(raw: &[char; 16]) -> String {
    raw.iter().take_while(|c| **c != '\0').collect()
}

fn chars_to_string<const N: usize>(raw: &[char; N]) -> String {
    raw.iter().take_while(|c| **c != '\0').collect()
}

/// Snapshot of the shared `location` attribute, or the default if it has
/// never been set, so `GLOBAL_POSITION_INT` and `VFR_HUD` can each update
/// only the fields they own without clobbering the other's contribution.
fn current_location(store: &AttributeStore) -> Location {
    match store.snapshot("location") {
        Some(AttributeValue::Location(location)) => location,
        _ => Location::default(),
    }
}

fn to_mav_frame(frame: MissionFrame) -> dialect::MavFrame {
    match frame {
        MissionFrame::Mission => dialect::MavFrame::MAV_FRAME_MISSION,
        MissionFrame::GlobalInt => dialect::MavFrame::MAV_FRAME_GLOBAL_INT,
        MissionFrame::GlobalRelativeAltInt => dialect::MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
        MissionFrame::GlobalTerrainAltInt => dialect::MavFrame::MAV_FRAME_GLOBAL_TERRAIN_ALT_INT,
        MissionFrame::LocalNed => dialect::MavFrame::MAV_FRAME_LOCAL_NED,
        MissionFrame::Other => dialect::MavFrame::MAV_FRAME_MISSION,
    }
}

fn from_mav_frame(frame: dialect::MavFrame) -> MissionFrame {
    match frame {
        dialect::MavFrame::MAV_FRAME_MISSION => MissionFrame::Mission,
        dialect::MavFrame::MAV_FRAME_GLOBAL_INT => MissionFrame::GlobalInt,
        dialect::MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT => MissionFrame::GlobalRelativeAltInt,
        dialect::MavFrame::MAV_FRAME_GLOBAL_TERRAIN_ALT_INT => MissionFrame::GlobalTerrainAltInt,
        dialect::MavFrame::MAV_FRAME_LOCAL_NED => MissionFrame::LocalNed,
        _ => MissionFrame::Other,
    }
}

fn to_mav_mission_type(mission_type: MissionType) -> dialect::MavMissionType {
    match mission_type {
        MissionType::Mission => dialect::MavMissionType::MAV_MISSION_TYPE_MISSION,
        MissionType::Fence => dialect::MavMissionType::MAV_MISSION_TYPE_FENCE,
        MissionType::Rally => dialect::MavMissionType::MAV_MISSION_TYPE_RALLY,
    }
}

fn mission_item_to_data(
    item: &MissionItem,
    target_system: u8,
    target_component: u8,
    mission_type: MissionType,
) -> Option<dialect::MISSION_ITEM_INT_DATA> {
    let command = dialect::MavCmd::from_u16(item.command)?;
    Some(dialect::MISSION_ITEM_INT_DATA {
        param1: item.param1,
        param2: item.param2,
        param3: item.param3,
        param4: item.param4,
        x: item.x,
        y: item.y,
        z: item.z,
        seq: item.seq,
        command,
        target_system,
        target_component,
        frame: to_mav_frame(item.frame),
        current: if item.current { 1 } else { 0 },
        autocontinue: if item.autocontinue { 1 } else { 0 },
        mission_type: to_mav_mission_type(mission_type),
    })
}

fn data_to_mission_item(data: &dialect::MISSION_ITEM_INT_DATA) -> MissionItem {
    MissionItem {
        seq: data.seq,
        command: data.command as u16,
        frame: from_mav_frame(data.frame),
        current: data.current != 0,
        autocontinue: data.autocontinue != 0,
        param1: data.param1,
        param2: data.param2,
        param3: data.param3,
        param4: data.param4,
        x: data.x,
        y: data.y,
        z: data.z,
    }
}

/// The single dedicated event loop (§4.D). Owns the transport, the
/// attribute store, the parameter set, the mission state, and the listener
/// tables for its whole lifetime; nothing else touches the connection.
pub struct LinkWorker {
    config: LinkConfig,
    transport: MavlinkTransport,
    attributes: Arc<Mutex<AttributeStore>>,
    listeners: Arc<Mutex<MessageListenerRegistry>>,
    state: Arc<Mutex<LinkState>>,
    exiting: Arc<AtomicBool>,
    commands: mpsc::Receiver<LinkCommand>,

    params: Arc<Mutex<ParamSet>>,
    mission_download: MissionDownload,
    mission_upload: MissionUpload,
    rc_readback: HashMap<String, u16>,

    target_system: u8,
    target_component: u8,
    have_target: bool,
    target_known: Arc<AtomicBool>,
    armed: bool,
    autopilot: dialect::MavAutopilot,
    vehicle_type: dialect::MavType,
    custom_mode: u32,

    last_heartbeat_sent: Instant,
    last_heartbeat_received: Option<Instant>,
    mission_deadline: Option<Instant>,
    mission_download_reply: Option<mpsc::Sender<Result<Vec<MissionItem>, GcsError>>>,
    mission_upload_reply: Option<mpsc::Sender<Result<(), GcsError>>>,
    requested_stream: bool,
    last_param_fetch_all: Option<Instant>,
}

impl LinkWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        address: String,
        config: LinkConfig,
        attributes: Arc<Mutex<AttributeStore>>,
        listeners: Arc<Mutex<MessageListenerRegistry>>,
        state: Arc<Mutex<LinkState>>,
        exiting: Arc<AtomicBool>,
        commands: mpsc::Receiver<LinkCommand>,
        params: Arc<Mutex<ParamSet>>,
        target_known: Arc<AtomicBool>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        let transport = MavlinkTransport::open(&address)?;
        Self::spawn_with_transport(transport, config, attributes, listeners, state, exiting, commands, params, target_known)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn_with_transport(
        transport: MavlinkTransport,
        config: LinkConfig,
        attributes: Arc<Mutex<AttributeStore>>,
        listeners: Arc<Mutex<MessageListenerRegistry>>,
        state: Arc<Mutex<LinkState>>,
        exiting: Arc<AtomicBool>,
        commands: mpsc::Receiver<LinkCommand>,
        params: Arc<Mutex<ParamSet>>,
        target_known: Arc<AtomicBool>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        let worker = Self::build(transport, config, attributes, listeners, state, exiting, commands, params, target_known);
        Ok(thread::spawn(move || worker.run()))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        transport: MavlinkTransport,
        config: LinkConfig,
        attributes: Arc<Mutex<AttributeStore>>,
        listeners: Arc<Mutex<MessageListenerRegistry>>,
        state: Arc<Mutex<LinkState>>,
        exiting: Arc<AtomicBool>,
        commands: mpsc::Receiver<LinkCommand>,
        params: Arc<Mutex<ParamSet>>,
        target_known: Arc<AtomicBool>,
    ) -> Self {
        LinkWorker {
            config,
            transport,
            attributes,
            listeners,
            state,
            exiting,
            commands,
            params,
            mission_download: MissionDownload::default(),
            mission_upload: MissionUpload::default(),
            rc_readback: HashMap::new(),
            target_system: 0,
            target_component: 0,
            have_target: false,
            target_known,
            armed: false,
            autopilot: dialect::MavAutopilot::MAV_AUTOPILOT_GENERIC,
            vehicle_type: dialect::MavType::MAV_TYPE_GENERIC,
            custom_mode: 0,
            last_heartbeat_sent: Instant::now() - Duration::from_secs(10),
            last_heartbeat_received: None,
            mission_deadline: None,
            mission_download_reply: None,
            mission_upload_reply: None,
            requested_stream: false,
            last_param_fetch_all: None,
        }
    }

    fn gcs_header(&self) -> MavHeader {
        MavHeader {
            system_id: self.config.gcs_system_id,
            component_id: self.config.gcs_component_id,
            sequence: 0,
        }
    }

    /// Overwrite `target_system`/`target_component` on outbound messages a
    /// caller composed directly (the `Enqueue` path only — every other send
    /// site in this worker already stamps the current target inline).
    fn rewrite_targets(&self, message: MavMessage) -> MavMessage {
        let target_system = self.target_system;
        let target_component = self.target_component;
        match message {
            MavMessage::COMMAND_LONG(mut data) => {
                data.target_system = target_system;
                data.target_component = target_component;
                MavMessage::COMMAND_LONG(data)
            }
            MavMessage::COMMAND_INT(mut data) => {
                data.target_system = target_system;
                data.target_component = target_component;
                MavMessage::COMMAND_INT(data)
            }
            MavMessage::SET_MODE(mut data) => {
                data.target_system = target_system;
                MavMessage::SET_MODE(data)
            }
            other => other,
        }
    }

    fn send(&mut self, message: MavMessage) {
        let header = self.gcs_header();
        match self.transport.send(&header, &message) {
            IoOutcome::Ready(()) | IoOutcome::Idle => {}
            IoOutcome::Transient(_) => self.reconnect(),
            IoOutcome::Fatal(err) => self.fail(GcsError::Io(err).to_string()),
        }
    }

    fn fail(&mut self, message: String) {
        *self.state.lock().expect("state lock") = LinkState::Error(message);
        self.exiting.store(true, Ordering::Relaxed);
    }

    fn reconnect(&mut self) {
        match self.transport.reopen() {
            Ok(()) => *self.state.lock().expect("state lock") = LinkState::Connected,
            Err(err) => self.fail(GcsError::Io(err).to_string()),
        }
    }

    pub fn run(mut self) {
        *self.state.lock().expect("state lock") = LinkState::Connected;

        while !self.exiting.load(Ordering::Relaxed) {
            self.drain_commands();
            self.param_fetch_all_step();
            self.param_watchdog_step();
            self.heartbeat_emit_step();
            self.heartbeat_watchdog_step();
            self.drain_inbound_step();
            self.mission_timeout_step();
            thread::sleep(Duration::from_millis(20));
        }

        *self.state.lock().expect("state lock") = LinkState::Disconnected;
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                LinkCommand::Enqueue(message) => {
                    let message = self.rewrite_targets(message);
                    self.send(message);
                }
                LinkCommand::ParamSet { name, value } => {
                    let target_system = self.target_system;
                    let target_component = self.target_component;
                    self.send(MavMessage::PARAM_SET(dialect::PARAM_SET_DATA {
                        param_value: value,
                        target_system,
                        target_component,
                        param_id: pad_param_id(&name.to_uppercase()),
                        param_type: dialect::MavParamType::MAV_PARAM_TYPE_REAL32,
                    }));
                }
                LinkCommand::MissionUpload { mission_type, items, reply } => {
                    self.mission_download.mission_type = mission_type;
                    let count = items.len() as u16;
                    self.mission_upload.start(items);
                    self.mission_upload_reply = Some(reply);
                    self.mission_deadline = self.config.mission_overall_timeout.map(|d| Instant::now() + d);
                    let target_system = self.target_system;
                    let target_component = self.target_component;
                    self.send(MavMessage::MISSION_CLEAR_ALL(dialect::MISSION_CLEAR_ALL_DATA {
                        target_system,
                        target_component,
                        mission_type: to_mav_mission_type(mission_type),
                    }));
                    if self.mission_upload.in_progress() {
                        self.send(MavMessage::MISSION_COUNT(dialect::MISSION_COUNT_DATA {
                            count,
                            target_system,
                            target_component,
                            mission_type: to_mav_mission_type(mission_type),
                        }));
                    } else if let Some(reply) = self.mission_upload_reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
                LinkCommand::MissionDownload { mission_type, reply } => {
                    self.mission_download.start(mission_type);
                    self.mission_download_reply = Some(reply);
                    self.mission_deadline = self.config.mission_overall_timeout.map(|d| Instant::now() + d);
                    let target_system = self.target_system;
                    let target_component = self.target_component;
                    self.send(MavMessage::MISSION_REQUEST_LIST(dialect::MISSION_REQUEST_LIST_DATA {
                        target_system,
                        target_component,
                        mission_type: to_mav_mission_type(mission_type),
                    }));
                }
                LinkCommand::Close => {
                    self.mission_deadline = None;
                    if let Some(reply) = self.mission_download_reply.take() {
                        let _ = reply.send(Err(GcsError::Cancelled));
                    }
                    if let Some(reply) = self.mission_upload_reply.take() {
                        let _ = reply.send(Err(GcsError::Cancelled));
                    }
                    self.exiting.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Startup protocol step 5 (§4.D.1): request the full parameter set at
    /// 100ms intervals until the first `PARAM_VALUE` announces a count. Once
    /// the watchdog-driven `ParamSet` has started, this stops firing.
    fn param_fetch_all_step(&mut self) {
        if !self.have_target || self.params.lock().expect("param lock").started() {
            return;
        }
        if let Some(last) = self.last_param_fetch_all {
            if last.elapsed() < Duration::from_millis(100) {
                return;
            }
        }
        self.last_param_fetch_all = Some(Instant::now());
        let target_system = self.target_system;
        let target_component = self.target_component;
        self.send(MavMessage::PARAM_REQUEST_LIST(dialect::PARAM_REQUEST_LIST_DATA { target_system, target_component }));
    }

    fn param_watchdog_step(&mut self) {
        let missing = self.params.lock().expect("param lock").watchdog_tick(Instant::now());
        if let Some(missing) = missing {
            let target_system = self.target_system;
            let target_component = self.target_component;
            for index in missing {
                self.send(MavMessage::PARAM_REQUEST_READ(dialect::PARAM_REQUEST_READ_DATA {
                    param_index: index as i16,
                    target_system,
                    target_component,
                    param_id: pad_param_id(""),
                }));
            }
        }
    }

    fn heartbeat_emit_step(&mut self) {
        if self.last_heartbeat_sent.elapsed() < Duration::from_secs(1) {
            return;
        }
        self.last_heartbeat_sent = Instant::now();
        self.send(MavMessage::HEARTBEAT(dialect::HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: dialect::MavType::MAV_TYPE_GCS,
            autopilot: dialect::MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: dialect::MavModeFlag::empty(),
            system_status: dialect::MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        }));
    }

    fn heartbeat_watchdog_step(&mut self) {
        let Some(last) = self.last_heartbeat_received else { return };
        if last.elapsed() <= self.config.heartbeat_silence_timeout {
            return;
        }
        tracing::warn!("link timeout");
        self.last_heartbeat_received = Some(Instant::now());
    }

    fn mission_timeout_step(&mut self) {
        let Some(deadline) = self.mission_deadline else { return };
        if Instant::now() < deadline {
            return;
        }
        self.mission_deadline = None;
        if let Some(reply) = self.mission_download_reply.take() {
            let _ = reply.send(Err(GcsError::Timeout));
        }
        if let Some(reply) = self.mission_upload_reply.take() {
            let _ = reply.send(Err(GcsError::Timeout));
        }
        self.mission_upload.finish();
    }

    fn drain_inbound_step(&mut self) {
        loop {
            match self.transport.recv() {
                IoOutcome::Ready((header, message)) => self.dispatch_inbound(header, message),
                IoOutcome::Idle => break,
                IoOutcome::Transient(_) => {
                    self.reconnect();
                    break;
                }
                IoOutcome::Fatal(err) => {
                    self.fail(GcsError::Io(err).to_string());
                    break;
                }
            }
        }
    }

    /// The full inbound dispatch pipeline (§4.D.3): parameter bookkeeping,
    /// mission sync, target/heartbeat bookkeeping, attribute updates, then
    /// user-registered listeners.
    fn dispatch_inbound(&mut self, header: MavHeader, message: MavMessage) {
        if let MavMessage::PARAM_VALUE(data) = &message {
            let id = param_id_to_string(&data.param_id);
            self.params
                .lock()
                .expect("param lock")
                .on_param_value(&id, data.param_value, data.param_index, data.param_count);
        }

        if let MavMessage::HEARTBEAT(data) = &message {
            self.last_heartbeat_received = Some(Instant::now());
            self.autopilot = data.autopilot;
            self.vehicle_type = data.mavtype;
            self.custom_mode = data.custom_mode;
            self.armed = data.base_mode.contains(dialect::MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
            if !self.have_target {
                self.have_target = true;
                self.target_system = header.system_id;
                self.target_component = header.component_id;
                self.target_known.store(true, Ordering::Relaxed);
            }
            if !self.requested_stream {
                self.requested_stream = true;
                self.request_data_streams();
            }
        }

        self.step_mission_download(&message);
        self.step_mission_current(&message);
        self.step_mission_upload(&message);
        self.update_attributes(&message);

        let name = message_name(&message);
        let listeners = self.listeners.clone();
        let guard = listeners.lock().expect("listener lock");
        guard.dispatch(&name, &message);
    }

    fn request_data_streams(&mut self) {
        let Some(rate) = self.config.data_stream_rate_hz else { return };
        let target_system = self.target_system;
        let target_component = self.target_component;
        self.send(MavMessage::REQUEST_DATA_STREAM(dialect::REQUEST_DATA_STREAM_DATA {
            req_message_rate: rate as u16,
            target_system,
            target_component,
            req_stream_id: dialect::MavDataStream::MAV_DATA_STREAM_ALL as u8,
            start_stop: 1,
        }));
    }

    fn step_mission_download(&mut self, message: &MavMessage) {
        if self.mission_download.loaded {
            return;
        }
        let action = match message {
            MavMessage::MISSION_COUNT(data) if data.mission_type == to_mav_mission_type(self.mission_download.mission_type) => {
                Some(self.mission_download.on_count(data.count))
            }
            MavMessage::MISSION_ITEM_INT(data) if data.mission_type == to_mav_mission_type(self.mission_download.mission_type) => {
                Some(self.mission_download.on_item(data_to_mission_item(data)))
            }
            _ => None,
        };
        let Some(action) = action else { return };
        match action {
            DownloadAction::RequestSeq(seq) => {
                let target_system = self.target_system;
                let target_component = self.target_component;
                let mission_type = to_mav_mission_type(self.mission_download.mission_type);
                self.send(MavMessage::MISSION_REQUEST_INT(dialect::MISSION_REQUEST_INT_DATA {
                    seq,
                    target_system,
                    target_component,
                    mission_type,
                }));
            }
            DownloadAction::None => {
                if self.mission_download.loaded {
                    self.mission_deadline = None;
                    if let Some(reply) = self.mission_download_reply.take() {
                        let _ = reply.send(Ok(self.mission_download.received.clone()));
                    }
                }
            }
        }
    }

    /// Dispatch pipeline step 3 (§4.D.3): track the vehicle's current
    /// waypoint index, independent of download/upload progress.
    fn step_mission_current(&mut self, message: &MavMessage) {
        if let MavMessage::MISSION_CURRENT(data) = message {
            let mut store = self.attributes.lock().expect("attr lock");
            store.set("current_waypoint", AttributeValue::CurrentWaypoint(data.seq));
            store.notify(&["current_waypoint"]);
        }
    }

    fn step_mission_upload(&mut self, message: &MavMessage) {
        if !self.mission_upload.in_progress() {
            return;
        }
        let requested_seq = match message {
            MavMessage::MISSION_REQUEST_INT(data) => Some(data.seq),
            MavMessage::MISSION_REQUEST(data) => Some(data.seq),
            _ => None,
        };
        if let Some(seq) = requested_seq {
            let target_system = self.target_system;
            let target_component = self.target_component;
            let mission_type = self.mission_download.mission_type;
            if let Some(item) = self.mission_upload.on_request(seq) {
                if let Some(data) = mission_item_to_data(&item, target_system, target_component, mission_type) {
                    self.send(MavMessage::MISSION_ITEM_INT(data));
                } else {
                    tracing::warn!(command = item.command, "unsupported MAV_CMD; dropping waypoint");
                }
            }
            return;
        }
        if let MavMessage::MISSION_ACK(data) = message {
            self.mission_upload.finish();
            self.mission_deadline = None;
            if let Some(reply) = self.mission_upload_reply.take() {
                let result = if data.mavtype == dialect::MavMissionResult::MAV_MISSION_ACCEPTED {
                    Ok(())
                } else {
                    Err(GcsError::MissionTransfer {
                        code: format!("{:?}", data.mavtype),
                        message: "vehicle rejected mission upload".to_string(),
                    })
                };
                let _ = reply.send(result);
            }
        }
    }

    /// The attribute-update table (§4.D.3's big table): decode a handful of
    /// telemetry message types into `AttributeValue`s and notify.
    fn update_attributes(&mut self, message: &MavMessage) {
        if let MavMessage::STATUSTEXT(data) = message {
            let text = chars_to_string(&data.text);
            for line in text.lines() {
                tracing::info!(">>> {line}");
            }
            return;
        }

        let mut store = self.attributes.lock().expect("attr lock");
        match message {
            MavMessage::HEARTBEAT(_) => {
                let mode = modes::mode_name(self.autopilot, self.vehicle_type, self.custom_mode);
                store.set("armed", AttributeValue::Armed(self.armed));
                store.set("mode", AttributeValue::Mode(mode));
                store.notify(&["armed", "mode"]);
            }
            MavMessage::GLOBAL_POSITION_INT(data) => {
                let mut location = current_location(&store);
                location.lat = data.lat as f64 / 1e7;
                location.lon = data.lon as f64 / 1e7;
                store.set("location", AttributeValue::Location(location));
                store.set(
                    "velocity",
                    AttributeValue::Velocity {
                        vx: data.vx as f64 / 100.0,
                        vy: data.vy as f64 / 100.0,
                        vz: data.vz as f64 / 100.0,
                    },
                );
                store.notify(&["location", "velocity"]);
            }
            MavMessage::LOCAL_POSITION_NED(data) => {
                store.set(
                    "local_position",
                    AttributeValue::LocalPosition { north: data.x, east: data.y, down: data.z },
                );
                store.notify(&["local_position"]);
            }
            MavMessage::GPS_RAW_INT(data) => {
                store.set(
                    "gps_0",
                    AttributeValue::Gps0 {
                        eph: data.eph,
                        epv: data.epv,
                        satellites_visible: data.satellites_visible,
                        fix_type: data.fix_type as u8,
                    },
                );
                store.notify(&["gps_0"]);
            }
            MavMessage::VFR_HUD(data) => {
                let mut location = current_location(&store);
                location.heading_deg = Some(data.heading as f32);
                location.alt = Some(data.alt);
                store.set("location", AttributeValue::Location(location));
                store.set("airspeed", AttributeValue::Airspeed(data.airspeed));
                store.set("groundspeed", AttributeValue::Groundspeed(data.groundspeed));
                store.notify(&["location", "airspeed", "groundspeed"]);
            }
            MavMessage::ATTITUDE(data) => {
                store.set(
                    "attitude",
                    AttributeValue::Attitude {
                        pitch: data.pitch,
                        yaw: data.yaw,
                        roll: data.roll,
                        pitchspeed: data.pitchspeed,
                        yawspeed: data.yawspeed,
                        rollspeed: data.rollspeed,
                    },
                );
                store.notify(&["attitude"]);
            }
            MavMessage::SYS_STATUS(data) => {
                // voltage_battery/current_battery are carried bit-preserved (raw mV/cA,
                // including current_battery's -1 "unknown" sentinel), not rescaled.
                store.set(
                    "battery",
                    AttributeValue::Battery {
                        voltage: data.voltage_battery as f32,
                        current: Some(data.current_battery as f32),
                        level: data.battery_remaining,
                    },
                );
                store.notify(&["battery"]);
            }
            MavMessage::RC_CHANNELS_RAW(data) => {
                let base = data.port as usize * 8;
                for (k, value) in [
                    data.chan1_raw,
                    data.chan2_raw,
                    data.chan3_raw,
                    data.chan4_raw,
                    data.chan5_raw,
                    data.chan6_raw,
                    data.chan7_raw,
                    data.chan8_raw,
                ]
                .into_iter()
                .enumerate()
                {
                    self.rc_readback.insert((base + k + 1).to_string(), value);
                }
                store.set("rc", AttributeValue::Rc(self.rc_readback.clone()));
                // no notify: readback is polled, never pushed (matches the source table).
            }
            MavMessage::MOUNT_STATUS(data) => {
                store.set(
                    "mount",
                    AttributeValue::Mount {
                        pitch: data.pointing_a as f32 / 100.0,
                        roll: data.pointing_b as f32 / 100.0,
                        yaw: data.pointing_c as f32 / 100.0,
                    },
                );
                store.notify(&["mount"]);
            }
            MavMessage::RANGEFINDER(data) => {
                store.set("rangefinder", AttributeValue::Rangefinder { distance: data.distance, voltage: data.voltage });
                store.notify(&["rangefinder"]);
            }
            MavMessage::EKF_STATUS_REPORT(data) => {
                let abs = data.flags.contains(dialect::EkfStatusFlags::EKF_POS_HORIZ_ABS);
                let const_pos = data.flags.contains(dialect::EkfStatusFlags::EKF_CONST_POS_MODE);
                let pred = data.flags.contains(dialect::EkfStatusFlags::EKF_PRED_POS_HORIZ_ABS);
                let ok = if self.armed { abs && !const_pos } else { abs || pred };
                store.set("ekf_ok", AttributeValue::EkfOk(ok));
                store.notify(&["ekf_ok"]);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::error::{MessageReadError, MessageWriteError};
    use mavlink::{MAVLinkMessageRaw, MavFrame, MavlinkVersion};
    use std::collections::VecDeque;

    struct MockConnection {
        protocol_version: Mutex<MavlinkVersion>,
        allow_any: Mutex<bool>,
        incoming: Mutex<VecDeque<(MavHeader, MavMessage)>>,
        sent: Mutex<Vec<MavMessage>>,
    }

    impl MockConnection {
        fn new(messages: Vec<MavMessage>) -> Self {
            let header = MavHeader { sequence: 1, system_id: 1, component_id: 1 };
            Self {
                protocol_version: Mutex::new(MavlinkVersion::V2),
                allow_any: Mutex::new(true),
                incoming: Mutex::new(messages.into_iter().map(|m| (header, m)).collect()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent_messages(&self) -> Vec<MavMessage> {
            self.sent.lock().expect("sent lock").clone()
        }
    }

    impl mavlink::MavConnection<MavMessage> for MockConnection {
        fn recv(&self) -> Result<(MavHeader, MavMessage), MessageReadError> {
            self.try_recv()
        }

        fn recv_raw(&self) -> Result<MAVLinkMessageRaw, MessageReadError> {
            Err(MessageReadError::Io(std::io::ErrorKind::WouldBlock.into()))
        }

        fn try_recv(&self) -> Result<(MavHeader, MavMessage), MessageReadError> {
            if let Some(message) = self.incoming.lock().expect("incoming lock").pop_front() {
                Ok(message)
            } else {
                Err(MessageReadError::Io(std::io::ErrorKind::WouldBlock.into()))
            }
        }

        fn send(&self, _header: &MavHeader, data: &MavMessage) -> Result<usize, MessageWriteError> {
            self.sent.lock().expect("sent lock").push(data.clone());
            Ok(1)
        }

        fn set_protocol_version(&mut self, version: MavlinkVersion) {
            *self.protocol_version.lock().expect("protocol lock") = version;
        }

        fn protocol_version(&self) -> MavlinkVersion {
            *self.protocol_version.lock().expect("protocol lock")
        }

        fn set_allow_recv_any_version(&mut self, allow: bool) {
            *self.allow_any.lock().expect("allow lock") = allow;
        }

        fn allow_recv_any_version(&self) -> bool {
            *self.allow_any.lock().expect("allow lock")
        }

        fn send_frame(&self, frame: &MavFrame<MavMessage>) -> Result<usize, MessageWriteError> {
            self.send(&frame.header, &frame.msg)
        }
    }

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(dialect::HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: dialect::MavType::MAV_TYPE_QUADROTOR,
            autopilot: dialect::MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: dialect::MavModeFlag::empty(),
            system_status: dialect::MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn sample_item(seq: u16) -> MissionItem {
        MissionItem {
            seq,
            command: 16,
            frame: MissionFrame::GlobalRelativeAltInt,
            current: seq == 0,
            autocontinue: true,
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: 473_977_420,
            y: 85_455_970,
            z: 25.0,
        }
    }

    fn mission_item_int(seq: u16) -> MavMessage {
        MavMessage::MISSION_ITEM_INT(dialect::MISSION_ITEM_INT_DATA {
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: 473_977_420,
            y: 85_455_970,
            z: 30.0,
            seq,
            command: dialect::MavCmd::MAV_CMD_NAV_WAYPOINT,
            target_system: 255,
            target_component: 190,
            frame: dialect::MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            current: 0,
            autocontinue: 1,
            mission_type: dialect::MavMissionType::MAV_MISSION_TYPE_MISSION,
        })
    }

    fn harness(messages: Vec<MavMessage>) -> (LinkWorker, Arc<Mutex<AttributeStore>>) {
        let transport = MavlinkTransport::from_connection("mock".into(), Box::new(MockConnection::new(messages)));
        let attributes = Arc::new(Mutex::new(AttributeStore::new()));
        let listeners = Arc::new(Mutex::new(MessageListenerRegistry::default()));
        let state = Arc::new(Mutex::new(LinkState::Connecting));
        let exiting = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = mpsc::channel();
        let params = Arc::new(Mutex::new(ParamSet::new(Duration::from_millis(200), Duration::from_secs(1))));
        let target_known = Arc::new(AtomicBool::new(false));
        let worker =
            LinkWorker::build(transport, LinkConfig::default(), attributes.clone(), listeners, state, exiting, rx, params, target_known);
        (worker, attributes)
    }

    #[test]
    fn heartbeat_establishes_target_and_requests_data_stream() {
        let (mut worker, attrs) = harness(vec![heartbeat()]);
        worker.drain_inbound_step();
        assert_eq!(worker.target_system, 1);
        assert_eq!(worker.target_component, 1);
        assert_eq!(attrs.lock().unwrap().snapshot("armed"), Some(AttributeValue::Armed(false)));
    }

    #[test]
    fn mission_download_requests_items_in_sequence_and_completes() {
        let (mut worker, _attrs) = harness(vec![
            heartbeat(),
            MavMessage::MISSION_COUNT(dialect::MISSION_COUNT_DATA {
                count: 2,
                target_system: 255,
                target_component: 190,
                mission_type: dialect::MavMissionType::MAV_MISSION_TYPE_MISSION,
            }),
            mission_item_int(0),
            mission_item_int(1),
        ]);
        worker.mission_download.start(MissionType::Mission);
        for _ in 0..4 {
            worker.drain_inbound_step();
        }
        assert!(worker.mission_download.loaded);
        assert_eq!(worker.mission_download.received.len(), 2);
    }

    #[test]
    fn mission_upload_serves_requested_items_and_finishes_on_ack() {
        let accepted_ack = MavMessage::MISSION_ACK(dialect::MISSION_ACK_DATA {
            target_system: 255,
            target_component: 190,
            mavtype: dialect::MavMissionResult::MAV_MISSION_ACCEPTED,
            mission_type: dialect::MavMissionType::MAV_MISSION_TYPE_MISSION,
            opaque_id: 0,
        });
        let (mut worker, _attrs) = harness(vec![
            heartbeat(),
            MavMessage::MISSION_REQUEST_INT(dialect::MISSION_REQUEST_INT_DATA {
                seq: 0,
                target_system: 255,
                target_component: 190,
                mission_type: dialect::MavMissionType::MAV_MISSION_TYPE_MISSION,
            }),
            MavMessage::MISSION_REQUEST_INT(dialect::MISSION_REQUEST_INT_DATA {
                seq: 1,
                target_system: 255,
                target_component: 190,
                mission_type: dialect::MavMissionType::MAV_MISSION_TYPE_MISSION,
            }),
            accepted_ack,
        ]);
        worker.mission_upload.start(vec![sample_item(0), sample_item(1)]);
        for _ in 0..4 {
            worker.drain_inbound_step();
        }
        assert!(!worker.mission_upload.in_progress());
    }

    #[test]
    fn mission_current_updates_attribute_independent_of_transfer_state() {
        let (mut worker, attrs) = harness(vec![MavMessage::MISSION_CURRENT(dialect::MISSION_CURRENT_DATA {
            seq: 3,
            total: 5,
            mission_state: dialect::MavMissionState::MISSION_STATE_ACTIVE,
            mission_mode: 0,
        })]);
        worker.drain_inbound_step();
        assert_eq!(attrs.lock().unwrap().snapshot("current_waypoint"), Some(AttributeValue::CurrentWaypoint(3)));
    }

    #[test]
    fn global_position_int_and_vfr_hud_merge_into_shared_location() {
        let (mut worker, attrs) = harness(vec![
            MavMessage::GLOBAL_POSITION_INT(dialect::GLOBAL_POSITION_INT_DATA {
                time_boot_ms: 0,
                lat: 473_977_418,
                lon: 85_455_940,
                alt: 0,
                relative_alt: 0,
                vx: 0,
                vy: 0,
                vz: 0,
                hdg: 0,
            }),
            MavMessage::VFR_HUD(dialect::VFR_HUD_DATA {
                airspeed: 12.0,
                groundspeed: 11.5,
                heading: 270,
                throttle: 50,
                alt: 123.4,
                climb: 0.0,
            }),
        ]);
        worker.drain_inbound_step();

        let location = match attrs.lock().unwrap().snapshot("location") {
            Some(AttributeValue::Location(location)) => location,
            other => panic!("expected a Location attribute, got {other:?}"),
        };
        assert!((location.lat - 47.3977418).abs() < 1e-6, "GLOBAL_POSITION_INT's lat must survive VFR_HUD's update");
        assert!((location.lon - 8.5455940).abs() < 1e-6);
        assert_eq!(location.heading_deg, Some(270.0), "VFR_HUD's heading must survive in the shared attribute");
        assert_eq!(location.alt, Some(123.4));
    }

    #[test]
    fn param_fetch_all_step_fires_once_per_interval_until_started() {
        let (mut worker, _attrs) = harness(vec![heartbeat()]);
        worker.drain_inbound_step();
        assert!(worker.have_target);
        worker.param_fetch_all_step();
        let first = worker.last_param_fetch_all.expect("should have fired once target is known");
        worker.param_fetch_all_step();
        assert_eq!(worker.last_param_fetch_all, Some(first), "should not re-fire inside the 100ms interval");

        worker.params.lock().unwrap().on_param_value("A", 1.0, 0, 1);
        worker.last_param_fetch_all = None;
        worker.param_fetch_all_step();
        assert!(worker.last_param_fetch_all.is_none(), "should stop firing once the param set has started");
    }

    #[test]
    fn enqueue_rewrites_command_long_targets() {
        let (mut worker, _attrs) = harness(vec![heartbeat()]);
        worker.drain_inbound_step();
        worker.drain_commands();
        let command = MavMessage::COMMAND_LONG(dialect::COMMAND_LONG_DATA {
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
            command: dialect::MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            target_system: 0,
            target_component: 0,
            confirmation: 0,
        });
        let rewritten = worker.rewrite_targets(command);
        match rewritten {
            MavMessage::COMMAND_LONG(data) => {
                assert_eq!(data.target_system, 1);
                assert_eq!(data.target_component, 1);
            }
            _ => panic!("expected COMMAND_LONG"),
        }
    }

    #[test]
    fn param_value_updates_shared_param_set() {
        let (mut worker, _attrs) = harness(vec![MavMessage::PARAM_VALUE(dialect::PARAM_VALUE_DATA {
            param_value: 42.0,
            param_count: 1,
            param_index: 0,
            param_id: pad_param_id("THR_MIN"),
            param_type: dialect::MavParamType::MAV_PARAM_TYPE_REAL32,
        })]);
        worker.drain_inbound_step();
        assert_eq!(worker.params.lock().unwrap().get("THR_MIN"), Some(42.0));
        assert!(worker.params.lock().unwrap().loaded());
    }

    fn ekf_report(flags: dialect::EkfStatusFlags) -> MavMessage {
        MavMessage::EKF_STATUS_REPORT(dialect::EKF_STATUS_REPORT_DATA {
            velocity_variance: 0.0,
            pos_horiz_variance: 0.0,
            pos_vert_variance: 0.0,
            compass_variance: 0.0,
            terrain_alt_variance: 0.0,
            flags,
        })
    }

    #[test]
    fn ekf_disarmed_ok_on_predicted_position_alone() {
        let (mut worker, attrs) = harness(vec![]);
        let message = ekf_report(dialect::EkfStatusFlags::EKF_PRED_POS_HORIZ_ABS);
        worker.dispatch_inbound(MavHeader { system_id: 1, component_id: 1, sequence: 0 }, message);
        assert_eq!(attrs.lock().unwrap().snapshot("ekf_ok"), Some(AttributeValue::EkfOk(true)));
    }

    #[test]
    fn ekf_armed_not_ok_in_const_pos_mode() {
        let (mut worker, attrs) = harness(vec![]);
        worker.armed = true;
        let message = ekf_report(dialect::EkfStatusFlags::EKF_POS_HORIZ_ABS | dialect::EkfStatusFlags::EKF_CONST_POS_MODE);
        worker.dispatch_inbound(MavHeader { system_id: 1, component_id: 1, sequence: 0 }, message);
        assert_eq!(attrs.lock().unwrap().snapshot("ekf_ok"), Some(AttributeValue::EkfOk(false)));
    }
}
