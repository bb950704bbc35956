use crate::message::{CanMessage, MessageError};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default J1939 priority used when none is supplied.
pub const J1939_DEFAULT_PRIORITY: u8 = 7;
/// Highest parameter group number that fits the 18-bit PGN field.
pub const J1939_PGN_MAX: u32 = 0x3_FFFF;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error initializing transport: {0}")]
    Init(String),
    #[error("Transport '{0}' used without an acquired bus handle")]
    NotAcquired(&'static str),
    #[error("Failed to send {frame}: {reason}")]
    Send { frame: String, reason: String },
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Sends single frames on the bus.
///
/// The bus handle is acquired per batch of sends through [`Transport::session`],
/// which hands out a [`BusSession`] guard that releases the handle on every
/// exit path, early returns and `?` propagation included.
pub trait Transport {
    /// Returns a static string name identifying the transport in logs.
    fn name(&self) -> &'static str;

    /// Opens the underlying bus handle.
    fn acquire(&mut self) -> Result<(), TransportError>;

    /// Transmits one frame. Requires an acquired handle.
    fn send(&mut self, message: &CanMessage) -> Result<(), TransportError>;

    /// Closes the underlying bus handle. Must be infallible and idempotent.
    fn release(&mut self);

    /// Acquires the bus for the lifetime of the returned guard.
    fn session(&mut self) -> Result<BusSession<'_, Self>, TransportError> {
        self.acquire()?;
        trace!(transport = self.name(), "Bus acquired");
        Ok(BusSession { transport: self })
    }
}

/// Scoped bus acquisition. Dropping the guard releases the handle.
pub struct BusSession<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
}

impl<T: Transport + ?Sized> BusSession<'_, T> {
    pub fn send(&mut self, message: &CanMessage) -> Result<(), TransportError> {
        self.transport.send(message)
    }
}

impl<T: Transport + ?Sized> Drop for BusSession<'_, T> {
    fn drop(&mut self) {
        self.transport.release();
        trace!(transport = self.transport.name(), "Bus released");
    }
}

/// How scanned identifiers are turned into arbitration ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Addressing {
    /// The scanned value is the arbitration id itself.
    #[default]
    Standard,
    /// The scanned value is a PGN, combined with priority and source address
    /// into a 29-bit extended id.
    J1939 { priority: u8 },
}

impl Addressing {
    pub fn j1939() -> Self {
        Addressing::J1939 {
            priority: J1939_DEFAULT_PRIORITY,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, Addressing::J1939 { .. })
    }

    /// Builds the frame for one scanned identifier. `source` is ignored in
    /// standard mode.
    pub fn frame(
        &self,
        id: u32,
        source: u8,
        data: Vec<u8>,
        delay: Duration,
    ) -> Result<CanMessage, MessageError> {
        match *self {
            Addressing::Standard => CanMessage::with_delay(id, data, delay),
            Addressing::J1939 { priority } => {
                let can_id = j1939_can_id(priority, id, source)?;
                Ok(CanMessage::with_delay(can_id, data, delay)?.with_extended(true))
            }
        }
    }
}

/// `priority << 26 | pgn << 8 | source`.
pub fn j1939_can_id(priority: u8, pgn: u32, source: u8) -> Result<u32, MessageError> {
    if pgn > J1939_PGN_MAX || priority > 7 {
        return Err(MessageError::IdOutOfRange(pgn));
    }
    Ok((u32::from(priority) << 26) | (pgn << 8) | u32::from(source))
}

/// Sends each frame by running an external command, e.g. `cansend can0 {frame}`.
///
/// Placeholders substituted in every argument: `{frame}` (candump shorthand),
/// `{id}` (hex id) and `{data}` (hex payload). A non-zero exit status is a send failure.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    command: Vec<String>,
    acquired: bool,
}

impl CommandTransport {
    pub fn new(command: Vec<String>) -> Result<Self, TransportError> {
        if command.is_empty() {
            return Err(TransportError::Init(
                "transport command is empty".to_string(),
            ));
        }
        Ok(Self {
            command,
            acquired: false,
        })
    }

    fn render_args(&self, message: &CanMessage) -> Vec<String> {
        let frame = message.to_string();
        let id = if message.is_extended() {
            format!("{:08X}", message.arb_id())
        } else {
            format!("{:03X}", message.arb_id())
        };
        let data = message.data_hex();
        self.command[1..]
            .iter()
            .map(|arg| {
                arg.replace("{frame}", &frame)
                    .replace("{id}", &id)
                    .replace("{data}", &data)
            })
            .collect()
    }
}

impl Transport for CommandTransport {
    fn name(&self) -> &'static str {
        "CommandTransport"
    }

    fn acquire(&mut self) -> Result<(), TransportError> {
        if self.acquired {
            warn!("Bus acquired twice without release");
        }
        self.acquired = true;
        Ok(())
    }

    fn send(&mut self, message: &CanMessage) -> Result<(), TransportError> {
        if !self.acquired {
            return Err(TransportError::NotAcquired(self.name()));
        }
        let send_error = |reason: String| TransportError::Send {
            frame: message.to_string(),
            reason,
        };
        let output = Command::new(&self.command[0])
            .args(self.render_args(message))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| send_error(format!("failed to spawn {:?}: {}", self.command, e)))?;
        if !output.status.success() {
            let desc = match output.status.code() {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            };
            return Err(send_error(format!(
                "{}: {}",
                desc,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(frame = %message, "Sent");
        Ok(())
    }

    fn release(&mut self) {
        self.acquired = false;
    }
}
