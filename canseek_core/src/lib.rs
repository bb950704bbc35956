pub mod bruteforce;
pub mod calibration;
pub mod config;
pub mod corpus;
pub mod finding;
pub mod localizer;
pub mod message;
pub mod mutation;
pub mod mutator;
pub mod observer;
pub mod omission;
pub mod scan;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use bruteforce::{PayloadSpec, SweepPlan, brute_force};
pub use calibration::{Calibration, CalibrationError, CalibrationSet};
pub use config::SessionConfig;
pub use corpus::{Corpus, CorpusError, RollingHistory};
pub use finding::{Finding, FindingLog};
pub use localizer::{
    LocalizeError, Localization, Localizer, LocalizerSettings, Polarity, SearchMode,
};
pub use message::{CanMessage, MessageError};
pub use mutation::mutation_scan;
pub use observer::{CalibratedSensor, CommandSensor, Observer, SensorDriver, SensorError, Snapshot};
pub use omission::{OmissionReport, omission_scan};
pub use scan::{IdentifyTrigger, LivenessCheck, ScanError, ScanReport, ScanSettings};
pub use transport::{Addressing, BusSession, CommandTransport, Transport, TransportError};
