use mavlink::ardupilotmega::MavMessage;
use mavlink::{connect, MavConnection, MavHeader};

/// Outcome of one `write`/`recv` attempt against the wire.
pub enum IoOutcome<T> {
    Ready(T),
    /// `recv` drained for now; not an error.
    Idle,
    /// Connection aborted/reset by peer: the link manager reopens at the same address.
    Transient(std::io::Error),
    /// Anything else: the link dies.
    Fatal(std::io::Error),
}

/// Bytes in/out over one MAVLink connection, reopenable at the same address.
///
/// `mavlink::connect` already does the framing (§4.B is external), so this
/// wrapper's job is purely to classify the errors it returns into transient
/// vs. fatal per §4.A, and to remember the address for reconnection.
pub struct MavlinkTransport {
    address: String,
    connection: Box<dyn MavConnection<MavMessage> + Send + Sync>,
}

impl MavlinkTransport {
    pub fn open(address: &str) -> std::io::Result<Self> {
        let mut connection = connect::<MavMessage>(address)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        connection.set_allow_recv_any_version(true);
        Ok(Self {
            address: address.to_string(),
            connection,
        })
    }

    /// Wrap an already-open connection (used by tests to inject a mock).
    pub fn from_connection(
        address: String,
        connection: Box<dyn MavConnection<MavMessage> + Send + Sync>,
    ) -> Self {
        Self { address, connection }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn reopen(&mut self) -> std::io::Result<()> {
        *self = Self::open(&self.address)?;
        Ok(())
    }

    pub fn send(&self, header: &MavHeader, message: &MavMessage) -> IoOutcome<()> {
        match self.connection.send(header, message) {
            Ok(_) => IoOutcome::Ready(()),
            Err(err) => classify_write_error(err),
        }
    }

    pub fn recv(&self) -> IoOutcome<(MavHeader, MavMessage)> {
        match self.connection.try_recv() {
            Ok((header, message)) => IoOutcome::Ready((header, message)),
            Err(mavlink::error::MessageReadError::Io(io_err)) => classify_read_io_error(io_err),
            Err(_) => IoOutcome::Idle, // decode error: swallowed per §7, retried next iteration
        }
    }
}

fn is_transient_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

fn classify_read_io_error(err: std::io::Error) -> IoOutcome<(MavHeader, MavMessage)> {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => IoOutcome::Idle,
        kind if is_transient_kind(kind) => IoOutcome::Transient(err),
        _ => IoOutcome::Fatal(err),
    }
}

fn classify_write_error(err: mavlink::error::MessageWriteError) -> IoOutcome<()> {
    match err {
        mavlink::error::MessageWriteError::Io(io_err) => {
            if is_transient_kind(io_err.kind()) {
                IoOutcome::Transient(io_err)
            } else {
                IoOutcome::Fatal(io_err)
            }
        }
    }
}
