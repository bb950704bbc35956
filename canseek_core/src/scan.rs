//! Online edge detection shared by the brute-force and mutation scanners.
//!
//! A [`ScanSession`] sends generated frames one at a time, keeps the most
//! recent ones in a [`RollingHistory`], and compares a fresh sensor
//! [`Snapshot`] against the recorded baseline after each send. When the
//! snapshot changes the history is handed to the [`Localizer`] so only the
//! frames sent within the response latency are searched.

use crate::corpus::RollingHistory;
use crate::finding::FindingLog;
use crate::localizer::{
    LocalizeError, Localization, Localizer, LocalizerSettings, Polarity, SearchMode,
};
use crate::message::{CanMessage, MessageError};
use crate::observer::{Observer, SensorError, Snapshot};
use crate::transport::{BusSession, Transport, TransportError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Expected delay between a send and its visible effect.
pub const DEFAULT_HISTORY_LATENCY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(
        "Target unresponsive: no response to verification frame {frame} on channel {channel} within {timeout:?} after {sent} sends"
    )]
    TargetUnresponsive {
        frame: String,
        channel: usize,
        timeout: Duration,
        sent: usize,
    },
    #[error("Invalid scan configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Localize(#[from] LocalizeError),
}

/// Which channel, if any, an edge is localized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentifyTrigger {
    /// Record edges only.
    #[default]
    Off,
    /// Localize when this channel is among the changed ones.
    Channel(usize),
    /// Localize on the lowest-numbered changed channel.
    FirstChanged,
}

impl IdentifyTrigger {
    pub fn select(&self, changed: &[usize]) -> Option<usize> {
        match *self {
            IdentifyTrigger::Off => None,
            IdentifyTrigger::Channel(channel) => changed.contains(&channel).then_some(channel),
            IdentifyTrigger::FirstChanged => changed.iter().copied().min(),
        }
    }
}

/// Periodic heartbeat proving the target still reacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessCheck {
    /// Verify after every `interval` scan frames.
    pub interval: usize,
    pub timeout: Duration,
    /// Frame known to switch `channel` ON.
    pub message: CanMessage,
    pub channel: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub history_len: usize,
    pub identify: IdentifyTrigger,
    pub search_mode: SearchMode,
    pub liveness: Option<LivenessCheck>,
    pub localizer: LocalizerSettings,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            history_len: 1,
            identify: IdentifyTrigger::Off,
            search_mode: SearchMode::Single,
            liveness: None,
            localizer: LocalizerSettings::default(),
        }
    }
}

impl ScanSettings {
    /// History length covering `latency` when frames go out every `delay`:
    /// the frames sent during the window plus the one just observed.
    pub fn history_len_for(latency: Duration, delay: Duration) -> usize {
        if delay.is_zero() {
            return 1;
        }
        let within = latency.as_nanos() / delay.as_nanos();
        usize::try_from(within).unwrap_or(usize::MAX - 1) + 1
    }
}

/// A change between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeEvent {
    /// 1-based count of scan frames sent when the edge was seen.
    pub sent_index: usize,
    /// The last frame sent before the edge.
    pub trigger: String,
    pub before: Snapshot,
    pub after: Snapshot,
    pub changed_channels: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub sent: usize,
    pub edges: Vec<EdgeEvent>,
    pub findings: FindingLog,
    /// Localizations that ended without isolating a frame, as `(channel, polarity)`.
    pub exhausted: Vec<(usize, Polarity)>,
}

/// Why a batch of sends stopped.
enum BatchEnd {
    Finished,
    Edge { snapshot: Snapshot },
}

/// One scan over a stream of generated frames.
pub struct ScanSession<'a, O: Observer + ?Sized, T: Transport + ?Sized> {
    observer: &'a mut O,
    transport: &'a mut T,
    settings: ScanSettings,
    history: RollingHistory,
    baseline: Snapshot,
    report: ScanReport,
    /// Scan frames sent when the last liveness check ran.
    verified_at: usize,
}

impl<'a, O: Observer + ?Sized, T: Transport + ?Sized> ScanSession<'a, O, T> {
    pub fn new(observer: &'a mut O, transport: &'a mut T, settings: ScanSettings) -> Self {
        Self {
            history: RollingHistory::new(settings.history_len),
            observer,
            transport,
            settings,
            baseline: Snapshot::new(Vec::new()),
            report: ScanReport::default(),
            verified_at: 0,
        }
    }

    /// Sends every frame of `frames`, each followed by an observation window of
    /// the frame's own delay.
    ///
    /// The bus is held for a whole run of frames and released before any
    /// localization, which replays through its own sessions.
    pub fn run<I>(mut self, frames: I) -> Result<ScanReport, ScanError>
    where
        I: IntoIterator<Item = Result<CanMessage, MessageError>>,
    {
        if let Some(check) = &self.settings.liveness {
            if check.interval == 0 {
                return Err(ScanError::Config(
                    "liveness interval must be at least 1".to_string(),
                ));
            }
        }
        let mut frames = frames.into_iter();
        self.baseline = self.observer.read_all()?;
        info!(baseline = %self.baseline, history = self.history.capacity(), "Scan started");

        loop {
            match self.send_batch(&mut frames)? {
                BatchEnd::Finished => break,
                BatchEnd::Edge { snapshot } => self.handle_edge(snapshot)?,
            }
        }

        info!(
            sent = self.report.sent,
            edges = self.report.edges.len(),
            findings = self.report.findings.len(),
            "Scan finished"
        );
        Ok(self.report)
    }

    fn send_batch<I>(&mut self, frames: &mut I) -> Result<BatchEnd, ScanError>
    where
        I: Iterator<Item = Result<CanMessage, MessageError>>,
    {
        let mut bus = self.transport.session()?;
        // A check that fell due on the send that produced the last edge runs first.
        if let Some(check) = due_check(self.settings.liveness.as_ref(), self.report.sent, self.verified_at) {
            verify_liveness(&mut *self.observer, &mut bus, check, &self.baseline, self.report.sent)?;
            self.verified_at = self.report.sent;
            self.baseline = self.observer.read_all()?;
        }
        for next in frames {
            let message = next?;
            bus.send(&message)?;
            self.report.sent += 1;
            debug!(frame = %message, sent = self.report.sent, "Sent");
            self.history.push(message.clone());

            if let Some(snapshot) = self
                .observer
                .wait_for_change(&self.baseline, message.delay())?
            {
                info!(frame = %message, from = %self.baseline, to = %snapshot, "Sensor changed");
                return Ok(BatchEnd::Edge { snapshot });
            }

            if let Some(check) = due_check(self.settings.liveness.as_ref(), self.report.sent, self.verified_at) {
                verify_liveness(&mut *self.observer, &mut bus, check, &self.baseline, self.report.sent)?;
                self.verified_at = self.report.sent;
                self.baseline = self.observer.read_all()?;
            }
        }
        Ok(BatchEnd::Finished)
    }

    fn handle_edge(&mut self, snapshot: Snapshot) -> Result<(), ScanError> {
        let changed = self.baseline.changed_channels(&snapshot);
        let trigger = self
            .history
            .latest()
            .map(ToString::to_string)
            .unwrap_or_default();
        self.report.edges.push(EdgeEvent {
            sent_index: self.report.sent,
            trigger,
            before: self.baseline.clone(),
            after: snapshot.clone(),
            changed_channels: changed.clone(),
        });

        let Some(channel) = self.settings.identify.select(&changed) else {
            self.baseline = snapshot;
            return Ok(());
        };

        let corpus = self.history.to_corpus();
        info!(channel, messages = corpus.len(), "Identifying");
        let localization = Localizer::new(
            &mut *self.observer,
            &mut *self.transport,
            channel,
            self.settings.localizer,
        )
        .localize(&corpus, self.settings.search_mode)?;
        self.report
            .findings
            .record_localization(channel, &localization);
        if let Localization::Exhausted { polarity, .. } = &localization {
            warn!(channel, %polarity, "No responsible frame in history");
            self.report.exhausted.push((channel, *polarity));
        }
        self.baseline = self.observer.read_all()?;
        Ok(())
    }
}

/// The liveness check due after `sent` scan frames, unless it already ran there.
fn due_check(
    liveness: Option<&LivenessCheck>,
    sent: usize,
    verified_at: usize,
) -> Option<&LivenessCheck> {
    liveness.filter(|check| sent > verified_at && sent % check.interval == 0)
}

/// Sends the verification frame and waits for its channel to go active, then
/// for it to return to its state in `baseline`.
fn verify_liveness<O, T>(
    observer: &mut O,
    bus: &mut BusSession<'_, T>,
    check: &LivenessCheck,
    baseline: &Snapshot,
    sent: usize,
) -> Result<(), ScanError>
where
    O: Observer + ?Sized,
    T: Transport + ?Sized,
{
    debug!(frame = %check.message, "Verifying target liveness");
    bus.send(&check.message)?;
    if !observer.wait_for(check.channel, true, check.timeout)? {
        error!(
            frame = %check.message,
            channel = check.channel,
            sent,
            "Target stopped responding"
        );
        return Err(ScanError::TargetUnresponsive {
            frame: check.message.to_string(),
            channel: check.channel,
            timeout: check.timeout,
            sent,
        });
    }
    let prior = baseline.is_active(check.channel);
    if !observer.wait_for(check.channel, prior, check.timeout)? {
        warn!(channel = check.channel, "Verification channel did not return to its prior state");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Lamp, SimTarget};

    fn frames(ids: std::ops::RangeInclusive<u32>) -> Vec<Result<CanMessage, MessageError>> {
        ids.map(|id| CanMessage::new(id, vec![0x00], 0.0)).collect()
    }

    fn quick_localizer() -> LocalizerSettings {
        LocalizerSettings {
            signal_delay: Duration::ZERO,
            repeat_delay: Duration::ZERO,
            retry_threshold: 3,
        }
    }

    #[test]
    fn history_length_covers_latency_window() {
        assert_eq!(
            ScanSettings::history_len_for(Duration::from_millis(500), Duration::from_millis(100)),
            6
        );
        assert_eq!(
            ScanSettings::history_len_for(Duration::from_millis(500), Duration::from_millis(300)),
            2
        );
        assert_eq!(
            ScanSettings::history_len_for(Duration::from_millis(500), Duration::ZERO),
            1
        );
    }

    #[test]
    fn identify_trigger_selects_channel() {
        assert_eq!(IdentifyTrigger::Off.select(&[0, 1]), None);
        assert_eq!(IdentifyTrigger::Channel(1).select(&[0, 1]), Some(1));
        assert_eq!(IdentifyTrigger::Channel(2).select(&[0, 1]), None);
        assert_eq!(IdentifyTrigger::FirstChanged.select(&[2, 1]), Some(1));
        assert_eq!(IdentifyTrigger::FirstChanged.select(&[]), None);
    }

    #[test]
    fn edges_are_recorded_without_identification() {
        let target = SimTarget::new().with_lamp(Lamp::momentary(|m| m.arb_id() == 0x12));
        let mut observer = target.observer();
        let mut transport = target.transport();
        let report = ScanSession::new(&mut observer, &mut transport, ScanSettings::default())
            .run(frames(0x10..=0x14))
            .unwrap();

        assert_eq!(report.sent, 5);
        assert_eq!(report.edges.len(), 2, "ON edge then OFF edge");
        assert_eq!(report.edges[0].trigger, "012#00");
        assert_eq!(report.edges[0].changed_channels, vec![0]);
        assert!(report.edges[0].after.is_active(0));
        assert!(report.findings.is_empty());
        assert_eq!(target.sent_ids(), vec![0x10, 0x11, 0x12, 0x13, 0x14]);
        assert_eq!(target.acquisitions(), target.releases());
        assert!(!target.is_acquired());
    }

    #[test]
    fn edge_triggers_localization_over_history() {
        let target = SimTarget::new().with_lamp(Lamp::momentary(|m| m.arb_id() == 0x15));
        let mut observer = target.observer();
        let mut transport = target.transport();
        let settings = ScanSettings {
            history_len: 4,
            identify: IdentifyTrigger::FirstChanged,
            localizer: quick_localizer(),
            ..ScanSettings::default()
        };
        let report = ScanSession::new(&mut observer, &mut transport, settings)
            .run(frames(0x10..=0x1A))
            .unwrap();

        assert_eq!(report.sent, 11);
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings.as_slice()[0];
        assert_eq!(finding.message.arb_id(), 0x15);
        assert_eq!(finding.channel, 0);
        assert_eq!(finding.polarity, Polarity::Activating);
        // Localization replays only the four most recent frames.
        assert!(
            target
                .sent_ids()
                .iter()
                .all(|id| (0x10..=0x1A).contains(id))
        );
        assert_eq!(target.acquisitions(), target.releases());
    }

    #[test]
    fn liveness_check_passes_on_responsive_target() {
        let target = SimTarget::new()
            .with_lamp(Lamp::momentary(|_| false))
            .with_lamp(Lamp::momentary(|m| m.arb_id() == 0x7E0));
        let mut observer = target.observer();
        let mut transport = target.transport();
        let settings = ScanSettings {
            liveness: Some(LivenessCheck {
                interval: 5,
                timeout: Duration::from_millis(5),
                message: CanMessage::new(0x7E0, vec![0x01], 0.0).unwrap(),
                channel: 1,
            }),
            ..ScanSettings::default()
        };
        let report = ScanSession::new(&mut observer, &mut transport, settings)
            .run(frames(0x10..=0x19))
            .unwrap();

        assert_eq!(report.sent, 10);
        assert!(report.edges.is_empty(), "verification frames never count as edges");
        assert_eq!(
            target.sent_ids().iter().filter(|&&id| id == 0x7E0).count(),
            2
        );
    }

    #[test]
    fn liveness_check_due_on_an_edge_still_runs() {
        // The fifth frame both changes channel 0 and falls due for verification.
        let target = SimTarget::new()
            .with_lamp(Lamp::momentary(|m| m.arb_id() == 0x14))
            .with_lamp(Lamp::momentary(|m| m.arb_id() == 0x7E0));
        let mut observer = target.observer();
        let mut transport = target.transport();
        let settings = ScanSettings {
            liveness: Some(LivenessCheck {
                interval: 5,
                timeout: Duration::from_millis(5),
                message: CanMessage::new(0x7E0, vec![0x01], 0.0).unwrap(),
                channel: 1,
            }),
            ..ScanSettings::default()
        };
        let report = ScanSession::new(&mut observer, &mut transport, settings)
            .run(frames(0x10..=0x16))
            .unwrap();

        assert_eq!(report.sent, 7);
        assert_eq!(report.edges[0].sent_index, 5);
        assert_eq!(
            target.sent_ids(),
            vec![0x10, 0x11, 0x12, 0x13, 0x14, 0x7E0, 0x15, 0x16]
        );
    }

    #[test]
    fn liveness_failure_aborts_scan_and_releases_bus() {
        let target = SimTarget::new().with_lamp(Lamp::momentary(|_| false));
        let mut observer = target.observer();
        let mut transport = target.transport();
        let settings = ScanSettings {
            liveness: Some(LivenessCheck {
                interval: 5,
                timeout: Duration::from_millis(2),
                message: CanMessage::new(0x7E0, vec![0x01], 0.0).unwrap(),
                channel: 0,
            }),
            ..ScanSettings::default()
        };
        let result =
            ScanSession::new(&mut observer, &mut transport, settings).run(frames(0x10..=0x30));

        match result {
            Err(ScanError::TargetUnresponsive { sent, channel, .. }) => {
                assert_eq!(sent, 5);
                assert_eq!(channel, 0);
            }
            other => panic!("Expected TargetUnresponsive, got {other:?}"),
        }
        assert_eq!(target.sent().len(), 6);
        assert!(!target.is_acquired());
    }

    #[test]
    fn zero_liveness_interval_is_rejected_before_sending() {
        let target = SimTarget::new().with_lamp(Lamp::momentary(|_| false));
        let mut observer = target.observer();
        let mut transport = target.transport();
        let settings = ScanSettings {
            liveness: Some(LivenessCheck {
                interval: 0,
                timeout: Duration::ZERO,
                message: CanMessage::new(0x7E0, vec![], 0.0).unwrap(),
                channel: 0,
            }),
            ..ScanSettings::default()
        };
        assert!(matches!(
            ScanSession::new(&mut observer, &mut transport, settings).run(frames(0x1..=0x2)),
            Err(ScanError::Config(_))
        ));
        assert!(target.sent().is_empty());
    }
}
