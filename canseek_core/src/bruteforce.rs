//! Identifier space sweep with online localization.

use crate::message::{parse_hex_payload, CanMessage, MessageError, EXTENDED_ID_MAX, STANDARD_ID_MAX};
use crate::mutator::random_payload;
use crate::observer::Observer;
use crate::scan::{ScanError, ScanReport, ScanSession, ScanSettings};
use crate::transport::{Addressing, Transport, J1939_PGN_MAX};
use rand::{Rng, RngCore};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Source address used when none is supplied.
pub const DEFAULT_SOURCE_ADDRESS: u8 = 0x32;
/// First PGN of the J1939 proprietary-B block.
pub const J1939_PROPRIETARY_START: u32 = 0xFF00;
/// Last PGN of the J1939 proprietary-B block.
pub const J1939_PROPRIETARY_END: u32 = 0xFFFF;

/// Payloads sent for each identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSpec {
    /// Every identifier is sent once with each payload, in order.
    Fixed(Vec<Vec<u8>>),
    /// Identifiers are drawn at random and each gets a fresh random payload.
    Random,
}

impl FromStr for PayloadSpec {
    type Err = MessageError;

    /// `random`, a single hex payload, or hex payloads separated by `:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("random") {
            return Ok(PayloadSpec::Random);
        }
        s.split(':')
            .map(parse_hex_payload)
            .collect::<Result<Vec<_>, _>>()
            .map(PayloadSpec::Fixed)
    }
}

/// What a brute-force sweep sends and how it addresses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    pub addressing: Addressing,
    pub sources: RangeInclusive<u8>,
    pub ids: RangeInclusive<u32>,
    pub payloads: PayloadSpec,
    pub delay: Duration,
}

impl SweepPlan {
    /// The whole 11-bit identifier space.
    pub fn standard(payloads: PayloadSpec, delay: Duration) -> Self {
        Self {
            addressing: Addressing::Standard,
            sources: DEFAULT_SOURCE_ADDRESS..=DEFAULT_SOURCE_ADDRESS,
            ids: 0..=STANDARD_ID_MAX,
            payloads,
            delay,
        }
    }

    /// The proprietary PGN block, sent from the default source address.
    pub fn j1939(payloads: PayloadSpec, delay: Duration) -> Self {
        Self {
            addressing: Addressing::j1939(),
            sources: DEFAULT_SOURCE_ADDRESS..=DEFAULT_SOURCE_ADDRESS,
            ids: J1939_PROPRIETARY_START..=J1939_PROPRIETARY_END,
            payloads,
            delay,
        }
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.ids.is_empty() {
            return Err(ScanError::Config(format!(
                "identifier range 0x{:x}..=0x{:x} is empty",
                self.ids.start(),
                self.ids.end()
            )));
        }
        if self.sources.is_empty() {
            return Err(ScanError::Config(format!(
                "source address range 0x{:x}..=0x{:x} is empty",
                self.sources.start(),
                self.sources.end()
            )));
        }
        let max = match self.addressing {
            Addressing::Standard => EXTENDED_ID_MAX,
            Addressing::J1939 { .. } => J1939_PGN_MAX,
        };
        if *self.ids.end() > max {
            return Err(ScanError::Config(format!(
                "identifier 0x{:x} exceeds 0x{:x} for {:?} addressing",
                self.ids.end(),
                max,
                self.addressing
            )));
        }
        if matches!(&self.payloads, PayloadSpec::Fixed(list) if list.is_empty()) {
            return Err(ScanError::Config("no payloads given".to_string()));
        }
        Ok(())
    }

    /// Number of frames the sweep sends, excluding verification frames.
    pub fn frame_count(&self) -> u64 {
        let ids = range_width(&self.ids);
        let sources = u64::from(self.sources.end().saturating_sub(*self.sources.start())) + 1;
        let per_id = match &self.payloads {
            PayloadSpec::Fixed(list) => list.len() as u64,
            PayloadSpec::Random => 1,
        };
        ids * sources * per_id
    }
}

/// Lazily enumerates the frames of a [`SweepPlan`].
///
/// Order is source address, then identifier, then payload. In random mode each
/// source gets as many draws as the identifier range is wide; the first draw
/// uses the lowest identifier and later ones jump uniformly across the range.
pub struct IdSweep<R: RngCore> {
    plan: SweepPlan,
    rng: R,
    source: Option<u8>,
    id: u32,
    payload_index: usize,
    draws_left: u64,
}

impl<R: RngCore> IdSweep<R> {
    pub fn new(plan: SweepPlan, rng: R) -> Self {
        let source = Some(*plan.sources.start());
        let id = *plan.ids.start();
        let draws_left = range_width(&plan.ids);
        Self {
            plan,
            rng,
            source,
            id,
            payload_index: 0,
            draws_left,
        }
    }

    fn next_source(&mut self) {
        self.source = self
            .source
            .filter(|s| s < self.plan.sources.end())
            .map(|s| s + 1);
        self.id = *self.plan.ids.start();
        self.payload_index = 0;
        self.draws_left = range_width(&self.plan.ids);
    }
}

fn range_width(ids: &RangeInclusive<u32>) -> u64 {
    u64::from(ids.end().saturating_sub(*ids.start())) + 1
}

impl<R: RngCore> Iterator for IdSweep<R> {
    type Item = Result<CanMessage, MessageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let source = self.source?;
        let (id, data) = match &self.plan.payloads {
            PayloadSpec::Fixed(list) => {
                let item = (self.id, list.get(self.payload_index)?.clone());
                self.payload_index += 1;
                if self.payload_index == list.len() {
                    self.payload_index = 0;
                    if self.id == *self.plan.ids.end() {
                        self.next_source();
                    } else {
                        self.id += 1;
                    }
                }
                item
            }
            PayloadSpec::Random => {
                let item = (self.id, random_payload(&mut self.rng));
                self.draws_left -= 1;
                if self.draws_left == 0 {
                    self.next_source();
                } else {
                    self.id = self.rng.random_range(self.plan.ids.clone());
                }
                item
            }
        };
        Some(self.plan.addressing.frame(id, source, data, self.plan.delay))
    }
}

/// Sweeps `plan`, localizing edges as configured in `settings`.
pub fn brute_force<O, T, R>(
    observer: &mut O,
    transport: &mut T,
    plan: SweepPlan,
    settings: ScanSettings,
    rng: R,
) -> Result<ScanReport, ScanError>
where
    O: Observer + ?Sized,
    T: Transport + ?Sized,
    R: RngCore,
{
    plan.validate()?;
    info!(
        ids = ?plan.ids,
        sources = ?plan.sources,
        addressing = ?plan.addressing,
        frames = plan.frame_count(),
        "Brute force sweep"
    );
    ScanSession::new(observer, transport, settings).run(IdSweep::new(plan, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localizer::LocalizerSettings;
    use crate::scan::IdentifyTrigger;
    use crate::testing::{Lamp, SimTarget};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0x5EED)
    }

    fn narrow_plan(ids: RangeInclusive<u32>, payloads: &str) -> SweepPlan {
        SweepPlan {
            ids,
            ..SweepPlan::standard(payloads.parse().unwrap(), Duration::ZERO)
        }
    }

    #[test]
    fn payload_spec_parsing() {
        assert_eq!("random".parse::<PayloadSpec>().unwrap(), PayloadSpec::Random);
        assert_eq!(
            "00:ff01".parse::<PayloadSpec>().unwrap(),
            PayloadSpec::Fixed(vec![vec![0x00], vec![0xff, 0x01]])
        );
        assert_eq!(
            "abc".parse::<PayloadSpec>(),
            Err(MessageError::OddHexLength(3))
        );
    }

    #[test]
    fn sends_each_identifier_once_in_order() {
        let target = SimTarget::new().with_lamp(Lamp::momentary(|_| false));
        let mut observer = target.observer();
        let mut transport = target.transport();
        let report = brute_force(
            &mut observer,
            &mut transport,
            narrow_plan(0x10..=0x12, "00"),
            ScanSettings::default(),
            rng(),
        )
        .unwrap();

        assert_eq!(report.sent, 3);
        let sent = target.sent();
        assert_eq!(target.sent_ids(), vec![0x10, 0x11, 0x12]);
        assert!(sent.iter().all(|m| m.data() == [0x00]));
        assert!(sent.iter().all(|m| !m.is_extended()));
    }

    #[test]
    fn multiple_payloads_are_innermost() {
        let frames: Vec<String> = IdSweep::new(narrow_plan(0x1..=0x2, "00:01"), rng())
            .map(|m| m.unwrap().to_string())
            .collect();
        assert_eq!(frames, vec!["001#00", "001#01", "002#00", "002#01"]);
    }

    #[test]
    fn j1939_sweep_composes_ids_per_source() {
        let plan = SweepPlan {
            sources: 0x31..=0x32,
            ids: 0xFF00..=0xFF01,
            ..SweepPlan::j1939("aa".parse().unwrap(), Duration::ZERO)
        };
        assert_eq!(plan.frame_count(), 4);
        let ids: Vec<u32> = IdSweep::new(plan, rng())
            .map(|m| m.unwrap().arb_id())
            .collect();
        assert_eq!(ids, vec![0x1CFF_0031, 0x1CFF_0131, 0x1CFF_0032, 0x1CFF_0132]);
    }

    #[test]
    fn random_mode_draws_range_width_frames_within_range() {
        let plan = narrow_plan(0x100..=0x10F, "random");
        let frames: Vec<CanMessage> = IdSweep::new(plan, rng()).map(|m| m.unwrap()).collect();
        assert_eq!(frames.len(), 16);
        assert_eq!(frames[0].arb_id(), 0x100);
        assert!(frames.iter().all(|m| (0x100..=0x10F).contains(&m.arb_id())));
        assert!(frames.iter().all(|m| m.data().len() <= 8));

        let again: Vec<CanMessage> = IdSweep::new(narrow_plan(0x100..=0x10F, "random"), rng())
            .map(|m| m.unwrap())
            .collect();
        assert_eq!(frames, again, "same seed must give the same sweep");
    }

    #[test]
    fn invalid_plans_are_rejected_before_sending() {
        let target = SimTarget::new().with_lamp(Lamp::momentary(|_| false));
        let mut observer = target.observer();
        let mut transport = target.transport();
        #[allow(clippy::reversed_empty_ranges)]
        let empty = narrow_plan(0x20..=0x10, "00");
        assert!(matches!(
            brute_force(&mut observer, &mut transport, empty, ScanSettings::default(), rng()),
            Err(ScanError::Config(_))
        ));
        let too_wide = SweepPlan {
            ids: 0xFF00..=0x4_0000,
            ..SweepPlan::j1939(PayloadSpec::Random, Duration::ZERO)
        };
        assert!(too_wide.validate().is_err());
        assert!(target.sent().is_empty());
    }

    #[test]
    fn change_during_sweep_is_localized_to_responsible_id() {
        let target = SimTarget::new().with_lamp(Lamp::momentary(|m| m.arb_id() == 0x15));
        let mut observer = target.observer();
        let mut transport = target.transport();
        let settings = ScanSettings {
            history_len: 4,
            identify: IdentifyTrigger::FirstChanged,
            localizer: LocalizerSettings {
                signal_delay: Duration::ZERO,
                repeat_delay: Duration::ZERO,
                retry_threshold: 5,
            },
            ..ScanSettings::default()
        };
        let report = brute_force(
            &mut observer,
            &mut transport,
            narrow_plan(0x10..=0x1F, "00"),
            settings,
            rng(),
        )
        .unwrap();

        assert_eq!(report.sent, 16);
        assert_eq!(report.edges.len(), 1);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings.as_slice()[0].message.arb_id(), 0x15);
        assert!(report.exhausted.is_empty());
    }
}
