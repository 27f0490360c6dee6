use std::time::Duration;

/// Tunables for a single link manager instance.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub gcs_system_id: u8,
    pub gcs_component_id: u8,
    /// `REQUEST_DATA_STREAM` rate in Hz issued during startup; `None` skips it.
    pub data_stream_rate_hz: Option<u32>,
    /// Whether `connect` blocks until the parameter set is loaded and a GPS fix type is known.
    pub await_params: bool,
    pub heartbeat_silence_timeout: Duration,
    pub param_watchdog_start: Duration,
    pub param_watchdog_repeat: Duration,
    /// Overall timeout for mission upload/download; the distilled protocol has none (see DESIGN.md).
    pub mission_overall_timeout: Option<Duration>,
    /// Bound on the worker's command/outbound channel; `send` blocks while full.
    pub command_buffer_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            gcs_system_id: 255,
            gcs_component_id: 190,
            data_stream_rate_hz: Some(4),
            await_params: false,
            heartbeat_silence_timeout: Duration::from_secs(5),
            param_watchdog_start: Duration::from_millis(200),
            param_watchdog_repeat: Duration::from_secs(1),
            mission_overall_timeout: Some(Duration::from_secs(30)),
            command_buffer_size: 256,
        }
    }
}
