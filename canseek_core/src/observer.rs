use crate::calibration::CalibrationSet;
use serde::Serialize;
use std::fmt;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Pause between two sensor reads inside a bounded wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Raw measurement of one sensor channel, e.g. a red/green/blue triple.
pub type Reading = Vec<f64>;

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Error initializing sensor: {0}")]
    Init(String),
    #[error("Sensor channel {channel} is not available ({available} configured)")]
    UnknownChannel { channel: usize, available: usize },
    #[error("Sensor read failed on channel {channel}: {reason}")]
    Read { channel: usize, reason: String },
    #[error("Reading on channel {channel} has {got} components, calibration expects {expected}")]
    DimensionMismatch {
        channel: usize,
        expected: usize,
        got: usize,
    },
}

/// The boolean state of every observed channel at one instant.
///
/// Two consecutive snapshots that differ on any channel form an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Snapshot(Vec<bool>);

impl Snapshot {
    pub fn new(states: Vec<bool>) -> Self {
        Self(states)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn states(&self) -> &[bool] {
        &self.0
    }

    pub fn is_active(&self, channel: usize) -> bool {
        self.0.get(channel).copied().unwrap_or(false)
    }

    /// Channels whose state differs between `self` and `other`, in ascending order.
    pub fn changed_channels(&self, other: &Snapshot) -> Vec<usize> {
        let width = self.0.len().max(other.0.len());
        (0..width)
            .filter(|&ch| self.0.get(ch) != other.0.get(ch))
            .collect()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: Vec<&str> = self
            .0
            .iter()
            .map(|on| if *on { "ON" } else { "OFF" })
            .collect();
        write!(f, "[{}]", states.join(" "))
    }
}

/// Low-level access to a multi-channel physical sensor.
///
/// Implementations only produce raw readings; turning readings into ON/OFF
/// decisions is the job of [`CalibratedSensor`].
pub trait SensorDriver {
    /// Returns a static string name identifying the driver in logs.
    fn name(&self) -> &'static str;

    /// Brings the hardware up. A failure here is fatal for the session.
    fn init(&mut self) -> Result<(), SensorError>;

    /// Number of channels the driver can read.
    fn channel_count(&self) -> usize;

    /// Takes one raw reading of `channel`.
    fn read(&mut self, channel: usize) -> Result<Reading, SensorError>;
}

/// An `Observer` reports whether the effect under test is currently visible.
///
/// It is the only feedback the search engine gets from the physical world.
/// Reads have no side effect beyond the physical measurement, so callers may
/// poll as often as they like.
pub trait Observer {
    /// Returns a static string name identifying the observer in logs.
    fn name(&self) -> &'static str;

    /// Number of logical channels this observer watches.
    fn channel_count(&self) -> usize;

    /// Whether `channel` currently shows the ON state.
    fn read_state(&mut self, channel: usize) -> Result<bool, SensorError>;

    /// Pause inserted between reads by the bounded waits below.
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Reads every channel once, in channel order.
    fn read_all(&mut self) -> Result<Snapshot, SensorError> {
        (0..self.channel_count())
            .map(|ch| self.read_state(ch))
            .collect::<Result<Vec<bool>, SensorError>>()
            .map(Snapshot::new)
    }

    /// Polls `channel` until it reads `desired` or `timeout` elapses.
    ///
    /// The channel is always read at least once, so a zero timeout still takes
    /// one sample. Returns whether the desired state was observed.
    fn wait_for(
        &mut self,
        channel: usize,
        desired: bool,
        timeout: Duration,
    ) -> Result<bool, SensorError> {
        let start = Instant::now();
        loop {
            if self.read_state(channel)? == desired {
                return Ok(true);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(false);
            }
            thread::sleep(self.poll_interval().min(timeout - elapsed));
        }
    }

    /// Polls all channels until the snapshot differs from `baseline` or `timeout`
    /// elapses, returning the differing snapshot if one was seen.
    fn wait_for_change(
        &mut self,
        baseline: &Snapshot,
        timeout: Duration,
    ) -> Result<Option<Snapshot>, SensorError> {
        let start = Instant::now();
        loop {
            let snapshot = self.read_all()?;
            if snapshot != *baseline {
                return Ok(Some(snapshot));
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(None);
            }
            thread::sleep(self.poll_interval().min(timeout - elapsed));
        }
    }
}

/// Turns raw driver readings into ON/OFF states using per-channel reference vectors.
pub struct CalibratedSensor<D: SensorDriver> {
    driver: D,
    calibrations: CalibrationSet,
    poll_interval: Duration,
}

impl<D: SensorDriver> CalibratedSensor<D> {
    /// Initializes the driver and binds it to `calibrations`. The observer
    /// watches as many channels as there are calibration entries.
    pub fn new(
        mut driver: D,
        calibrations: CalibrationSet,
        poll_interval: Duration,
    ) -> Result<Self, SensorError> {
        driver.init()?;
        if calibrations.len() > driver.channel_count() {
            return Err(SensorError::Init(format!(
                "{} calibrated channels but driver '{}' only has {}",
                calibrations.len(),
                driver.name(),
                driver.channel_count()
            )));
        }
        debug!(
            driver = driver.name(),
            channels = calibrations.len(),
            "Calibrated sensor ready"
        );
        Ok(Self {
            driver,
            calibrations,
            poll_interval,
        })
    }

    /// Signed distance of the current reading from the decision boundary.
    /// Negative values are on the ON side.
    pub fn margin(&mut self, channel: usize) -> Result<f64, SensorError> {
        let calibration = self
            .calibrations
            .get(channel)
            .ok_or(SensorError::UnknownChannel {
                channel,
                available: self.calibrations.len(),
            })?;
        let reading = self.driver.read(channel)?;
        calibration
            .margin(&reading)
            .ok_or(SensorError::DimensionMismatch {
                channel,
                expected: calibration.dimensions(),
                got: reading.len(),
            })
    }

    pub fn into_driver(self) -> D {
        self.driver
    }
}

impl<D: SensorDriver> Observer for CalibratedSensor<D> {
    fn name(&self) -> &'static str {
        self.driver.name()
    }

    fn channel_count(&self) -> usize {
        self.calibrations.len()
    }

    fn read_state(&mut self, channel: usize) -> Result<bool, SensorError> {
        Ok(self.margin(channel)? < 0.0)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// A driver that obtains each reading by running an external command.
///
/// Every `{channel}` in the argument template is replaced by the channel index;
/// the command must print the reading's components, whitespace separated.
#[derive(Debug, Clone)]
pub struct CommandSensor {
    command: Vec<String>,
    channels: usize,
}

impl CommandSensor {
    pub fn new(command: Vec<String>, channels: usize) -> Self {
        Self { command, channels }
    }

    fn build_command(&self, channel: usize) -> Result<Command, SensorError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SensorError::Init("sensor command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        let channel_text = channel.to_string();
        for arg in args {
            cmd.arg(arg.replace("{channel}", &channel_text));
        }
        Ok(cmd)
    }
}

impl SensorDriver for CommandSensor {
    fn name(&self) -> &'static str {
        "CommandSensor"
    }

    fn init(&mut self) -> Result<(), SensorError> {
        for channel in 0..self.channels {
            self.read(channel)
                .map_err(|e| SensorError::Init(format!("probe read failed: {e}")))?;
        }
        Ok(())
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn read(&mut self, channel: usize) -> Result<Reading, SensorError> {
        if channel >= self.channels {
            return Err(SensorError::UnknownChannel {
                channel,
                available: self.channels,
            });
        }
        let read_error = |reason: String| SensorError::Read { channel, reason };
        let output = self
            .build_command(channel)?
            .output()
            .map_err(|e| read_error(format!("failed to spawn {:?}: {}", self.command, e)))?;
        if !output.status.success() {
            return Err(read_error(format!(
                "{:?} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reading = stdout
            .split_whitespace()
            .map(|c| c.parse::<f64>().map_err(|e| read_error(format!("bad component '{c}': {e}"))))
            .collect::<Result<Reading, SensorError>>()?;
        if reading.is_empty() {
            return Err(read_error("command printed no reading".to_string()));
        }
        trace!(channel, ?reading, "Sensor reading");
        Ok(reading)
    }
}
