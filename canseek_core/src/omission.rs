//! Leave-one-out attribution of an effect to a single arbitration id.

use crate::corpus::Corpus;
use crate::localizer::{replay, LocalizeError, ReplayMode};
use crate::observer::Observer;
use crate::transport::Transport;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OmissionReport {
    /// Identifiers replayed-without so far, in test order.
    pub tested: Vec<u32>,
    /// The first identifier whose removal stopped the effect.
    pub responsible: Option<u32>,
}

/// Replays `corpus` once per distinct identifier with that identifier removed.
///
/// Before each replay the channel is given `settle` to return to its starting
/// state, then read again; the target is the opposite of that reading, so a
/// latched effect left ON by an earlier replay is looked for as OFF. A replay
/// that still reproduces the target clears the omitted identifier; the first
/// one that does not is reported and ends the scan.
pub fn omission_scan<O, T>(
    observer: &mut O,
    transport: &mut T,
    corpus: &Corpus,
    channel: usize,
    signal_delay: Duration,
    settle: Duration,
) -> Result<OmissionReport, LocalizeError>
where
    O: Observer + ?Sized,
    T: Transport + ?Sized,
{
    if corpus.is_empty() {
        return Err(LocalizeError::EmptyCorpus);
    }
    let baseline = observer.read_state(channel)?;
    let ids = corpus.distinct_ids();
    info!(
        channel,
        messages = corpus.len(),
        ids = ids.len(),
        baseline,
        "Omission scan"
    );

    let mut report = OmissionReport::default();
    for id in ids {
        if !observer.wait_for(channel, baseline, settle)? {
            warn!(channel, baseline, "Channel did not settle back to its starting state");
        }
        let target = !observer.read_state(channel)?;
        let filtered = corpus.without_id(id);
        report.tested.push(id);
        let mut observed = replay(
            &mut *observer,
            &mut *transport,
            channel,
            filtered.as_slice(),
            target,
            ReplayMode::ObserveAll,
        )?;
        if !observed {
            observed = observer.wait_for(channel, target, signal_delay)?;
        }
        if observed {
            debug!(id = format_args!("0x{id:x}"), "Effect still reproduced without id");
            continue;
        }
        info!(id = format_args!("0x{id:x}"), target, "Effect disappears without id");
        report.responsible = Some(id);
        break;
    }
    Ok(report)
}
