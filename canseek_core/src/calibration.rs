use crate::observer::{SensorDriver, SensorError};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Separates the ON and OFF reference vectors on a calibration record line.
pub const RECORD_DELIMITER: char = ',';

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Calibration I/O error: {0}")]
    Io(String),
    #[error("Calibration record line {line_no} is malformed: {reason}")]
    Malformed { line_no: usize, reason: String },
    #[error("Requested {requested} sensor channels but only {available} calibration records exist")]
    NotEnoughChannels { requested: usize, available: usize },
    #[error("Reference vectors differ in length (on: {on}, off: {off})")]
    DimensionMismatch { on: usize, off: usize },
    #[error("Calibration aborted by operator: {0}")]
    Aborted(String),
    #[error(transparent)]
    Sensor(#[from] SensorError),
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::Io(err.to_string())
    }
}

/// Reference readings for one channel, taken with the observed control ON and OFF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    on_reference: Vec<f64>,
    off_reference: Vec<f64>,
}

impl Calibration {
    pub fn new(on_reference: Vec<f64>, off_reference: Vec<f64>) -> Result<Self, CalibrationError> {
        if on_reference.len() != off_reference.len() || on_reference.is_empty() {
            return Err(CalibrationError::DimensionMismatch {
                on: on_reference.len(),
                off: off_reference.len(),
            });
        }
        Ok(Self {
            on_reference,
            off_reference,
        })
    }

    pub fn on_reference(&self) -> &[f64] {
        &self.on_reference
    }

    pub fn off_reference(&self) -> &[f64] {
        &self.off_reference
    }

    pub fn dimensions(&self) -> usize {
        self.on_reference.len()
    }

    /// `distance(reading, on) - distance(reading, off)`; negative means the reading
    /// is closer to the ON reference. `None` when the reading has the wrong dimension.
    pub fn margin(&self, reading: &[f64]) -> Option<f64> {
        if reading.len() != self.dimensions() {
            return None;
        }
        Some(distance(reading, &self.on_reference) - distance(reading, &self.off_reference))
    }

    pub fn is_on(&self, reading: &[f64]) -> Option<bool> {
        self.margin(reading).map(|margin| margin < 0.0)
    }

    fn parse_record(line_no: usize, line: &str) -> Result<Self, CalibrationError> {
        let malformed = |reason: String| CalibrationError::Malformed { line_no, reason };
        let (on_text, off_text) = line
            .split_once(RECORD_DELIMITER)
            .ok_or_else(|| malformed(format!("expected two vectors separated by '{RECORD_DELIMITER}'")))?;
        let on_reference = parse_vector(on_text).map_err(malformed)?;
        let off_reference = parse_vector(off_text).map_err(malformed)?;
        Self::new(on_reference, off_reference).map_err(|e| malformed(e.to_string()))
    }

    fn to_record(&self) -> String {
        format!(
            "{}{} {}",
            join_vector(&self.on_reference),
            RECORD_DELIMITER,
            join_vector(&self.off_reference)
        )
    }
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn parse_vector(text: &str) -> Result<Vec<f64>, String> {
    let components = text
        .split_whitespace()
        .map(|c| {
            c.parse::<f64>()
                .map_err(|e| format!("invalid component '{}': {}", c, e))
        })
        .collect::<Result<Vec<f64>, String>>()?;
    if components.is_empty() {
        return Err("empty reference vector".to_string());
    }
    Ok(components)
}

fn join_vector(v: &[f64]) -> String {
    v.iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Per-channel calibrations, index `i` belonging to sensor channel `i`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationSet {
    channels: Vec<Calibration>,
}

impl CalibrationSet {
    pub fn new(channels: Vec<Calibration>) -> Self {
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, channel: usize) -> Option<&Calibration> {
        self.channels.get(channel)
    }

    /// Parses a textual record and keeps the first `requested` channels.
    /// Fails when the record holds fewer channels than requested.
    pub fn parse(text: &str, requested: usize) -> Result<Self, CalibrationError> {
        let mut channels = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            channels.push(Calibration::parse_record(index + 1, line)?);
        }
        if channels.len() < requested {
            return Err(CalibrationError::NotEnoughChannels {
                requested,
                available: channels.len(),
            });
        }
        channels.truncate(requested);
        Ok(Self { channels })
    }

    pub fn load(path: &Path, requested: usize) -> Result<Self, CalibrationError> {
        let text = fs::read_to_string(path).map_err(|e| {
            CalibrationError::Io(format!("Failed to read calibration file {:?}: {}", path, e))
        })?;
        Self::parse(&text, requested)
    }

    pub fn to_record_string(&self) -> String {
        let mut out = String::new();
        for calibration in &self.channels {
            let _ = writeln!(out, "{}", calibration.to_record());
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        fs::write(path, self.to_record_string()).map_err(|e| {
            CalibrationError::Io(format!("Failed to write calibration file {:?}: {}", path, e))
        })
    }
}

/// Samples every channel once with the control OFF and once with it ON.
///
/// `confirm` is shown a prompt and must return once the operator has put the
/// control into the requested state; an error from it aborts calibration.
pub fn calibrate_interactive<D, F>(
    driver: &mut D,
    channels: usize,
    mut confirm: F,
) -> Result<CalibrationSet, CalibrationError>
where
    D: SensorDriver + ?Sized,
    F: FnMut(&str) -> std::io::Result<()>,
{
    driver.init()?;
    if channels > driver.channel_count() {
        return Err(CalibrationError::NotEnoughChannels {
            requested: channels,
            available: driver.channel_count(),
        });
    }

    confirm("press enter when control is OFF").map_err(|e| CalibrationError::Aborted(e.to_string()))?;
    let off_readings = (0..channels)
        .map(|ch| driver.read(ch))
        .collect::<Result<Vec<_>, _>>()?;

    confirm("press enter when control is ON").map_err(|e| CalibrationError::Aborted(e.to_string()))?;
    let on_readings = (0..channels)
        .map(|ch| driver.read(ch))
        .collect::<Result<Vec<_>, _>>()?;

    let calibrations = on_readings
        .into_iter()
        .zip(off_readings)
        .map(|(on, off)| Calibration::new(on, off))
        .collect::<Result<Vec<_>, _>>()?;
    for (channel, calibration) in calibrations.iter().enumerate() {
        info!(
            channel,
            on = ?calibration.on_reference(),
            off = ?calibration.off_reference(),
            "Channel calibrated"
        );
    }
    Ok(CalibrationSet::new(calibrations))
}
