use crate::message::CanMessage;
use crate::mutator::BitFlips;
use crate::observer::Observer;
use crate::scan::{ScanError, ScanReport, ScanSession, ScanSettings};
use crate::transport::Transport;
use std::ops::RangeInclusive;
use tracing::info;

/// Sends every single-bit variant of `base` over `bits` (inclusive) and
/// localizes edges over the history of sent variants.
///
/// A bit range reaching past the payload fails before anything is sent.
pub fn mutation_scan<O, T>(
    observer: &mut O,
    transport: &mut T,
    base: CanMessage,
    bits: RangeInclusive<usize>,
    settings: ScanSettings,
) -> Result<ScanReport, ScanError>
where
    O: Observer + ?Sized,
    T: Transport + ?Sized,
{
    let flips = BitFlips::new(base.clone(), bits.clone())?;
    info!(frame = %base, ?bits, variants = flips.len(), "Bit mutation scan");
    ScanSession::new(observer, transport, settings).run(flips)
}
