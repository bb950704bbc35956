use crate::localizer::{Localization, Polarity};
use crate::message::CanMessage;
use serde::Serialize;
use std::collections::HashSet;

/// A frame isolated as responsible for a state change on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub channel: usize,
    pub polarity: Polarity,
    pub frame: String,
    pub message: CanMessage,
    /// MD5 over id, flags and payload; stable across delays.
    pub fingerprint: String,
}

impl Finding {
    pub fn new(channel: usize, polarity: Polarity, message: CanMessage) -> Self {
        Self {
            channel,
            polarity,
            frame: message.to_string(),
            fingerprint: message.fingerprint(),
            message,
        }
    }
}

/// Findings in discovery order, without repeats of the same frame.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct FindingLog {
    findings: Vec<Finding>,
    #[serde(skip)]
    seen: HashSet<(usize, Polarity, [u8; 16])>,
}

impl FindingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `finding` unless the same frame was already recorded for the same
    /// channel and polarity. Returns whether it was new.
    pub fn record(&mut self, finding: Finding) -> bool {
        let key = (finding.channel, finding.polarity, finding.message.digest());
        if !self.seen.insert(key) {
            return false;
        }
        self.findings.push(finding);
        true
    }

    /// Records every frame a localization isolated, including the activating
    /// frame of a dual search whose deactivating half was exhausted.
    pub fn record_localization(&mut self, channel: usize, localization: &Localization) -> usize {
        let (activating, deactivating) = match localization {
            Localization::Found {
                activating,
                deactivating,
                ..
            } => (Some(activating), deactivating.as_ref()),
            Localization::Exhausted { activating, .. } => (activating.as_ref(), None),
        };
        let mut added = 0;
        if let Some(on) = activating {
            added += usize::from(self.record(Finding::new(
                channel,
                Polarity::Activating,
                on.clone(),
            )));
        }
        if let Some(off) = deactivating {
            added += usize::from(self.record(Finding::new(
                channel,
                Polarity::Deactivating,
                off.clone(),
            )));
        }
        added
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Finding> {
        self.findings.iter()
    }

    pub fn as_slice(&self) -> &[Finding] {
        &self.findings
    }
}
