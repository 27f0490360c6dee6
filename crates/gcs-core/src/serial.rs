/// Enumerate serial port device names the host currently sees, for use as a
/// connection-string candidate list in client UIs.
pub fn list_serial_ports() -> Result<Vec<String>, String> {
    let ports = serialport::available_ports().map_err(|err| format!("unable to list serial ports: {err}"))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
