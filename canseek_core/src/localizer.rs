//! Bisection search for the frame responsible for an observed state change.
//!
//! The localizer replays halves of a corpus and watches one sensor channel. A
//! half that reproduces the target state becomes the new search frame; when
//! neither half does, the probe is treated as noise and retried, and repeated
//! failures at the same frame backtrack to its parent.

use crate::corpus::Corpus;
use crate::message::CanMessage;
use crate::observer::{Observer, SensorError};
use crate::transport::{Transport, TransportError};
use serde::Serialize;
use std::fmt;
use std::ops::Range;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Grace period granted after a half has been sent without a response.
pub const DEFAULT_SIGNAL_DELAY: Duration = Duration::from_millis(250);
/// Pause after every probe so a response still in flight cannot leak into the next one.
pub const DEFAULT_REPEAT_DELAY: Duration = Duration::from_millis(500);
/// Inconclusive probes tolerated at one frame before backtracking.
pub const DEFAULT_RETRY_THRESHOLD: u32 = 5;

#[derive(Error, Debug)]
pub enum LocalizeError {
    #[error("Cannot localize over an empty corpus")]
    EmptyCorpus,
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The state transition being searched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// The frame that switches the channel ON.
    Activating,
    /// The frame that switches the channel OFF.
    Deactivating,
}

impl Polarity {
    /// Channel state that confirms this polarity was reproduced.
    pub fn target_state(self) -> bool {
        matches!(self, Polarity::Activating)
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarity::Activating => f.write_str("activating"),
            Polarity::Deactivating => f.write_str("deactivating"),
        }
    }
}

/// Which polarities a localization looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// Only the activating frame. While the channel is ON the search waits for it to turn OFF.
    #[default]
    Single,
    /// The activating and the deactivating frame, each on its own frame stack.
    Dual,
}

/// How a batch replay treats the first observed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Stop sending as soon as the target state is seen.
    StopAtSignal,
    /// Send the whole batch and report whether the target state was seen at any point.
    ObserveAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalizerSettings {
    pub signal_delay: Duration,
    pub repeat_delay: Duration,
    pub retry_threshold: u32,
}

impl Default for LocalizerSettings {
    fn default() -> Self {
        Self {
            signal_delay: DEFAULT_SIGNAL_DELAY,
            repeat_delay: DEFAULT_REPEAT_DELAY,
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
        }
    }
}

/// A contiguous run of corpus indices under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchFrame {
    pub start: usize,
    pub end: usize,
}

impl SearchFrame {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Splits at `start + len / 2`; the first half is never the longer one.
    pub fn split(&self) -> (SearchFrame, SearchFrame) {
        let mid = self.start + self.len() / 2;
        (
            SearchFrame {
                start: self.start,
                end: mid,
            },
            SearchFrame {
                start: mid,
                end: self.end,
            },
        )
    }

    fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Frames narrowed so far for one polarity, root at the bottom.
///
/// Every frame is contained in the one below it and the root always spans
/// the whole corpus, so the stack never underflows.
#[derive(Debug, Clone)]
pub struct FrameStack {
    frames: Vec<SearchFrame>,
    retry_count: u32,
}

impl FrameStack {
    pub fn new(corpus_len: usize) -> Self {
        Self {
            frames: vec![SearchFrame {
                start: 0,
                end: corpus_len,
            }],
            retry_count: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn top(&self) -> SearchFrame {
        // The root is never popped.
        self.frames[self.frames.len() - 1]
    }

    fn push(&mut self, frame: SearchFrame) {
        self.frames.push(frame);
        self.retry_count = 0;
    }

    fn backtrack(&mut self) -> bool {
        if self.frames.len() <= 1 {
            return false;
        }
        self.frames.pop();
        self.retry_count = 0;
        true
    }
}

/// Result of one probe round on a [`FrameStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The top frame holds a single frame: the responsible one. Also returned
    /// when the half just pushed is a single frame.
    Found(CanMessage),
    /// A half of two or more frames reproduced the target and was pushed;
    /// `depth` is the new stack depth.
    Narrowed { depth: usize },
    /// Neither half reproduced the target; the same frame will be probed again.
    Retry { count: u32 },
    /// The retry budget ran out and the top frame was discarded.
    Backtracked { depth: usize },
    /// The retry budget ran out at the root frame. Nothing can be isolated.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Localization {
    Found {
        activating: CanMessage,
        deactivating: Option<CanMessage>,
        rounds: usize,
    },
    /// The search for `polarity` ran out of frames. In dual mode `activating`
    /// keeps the activating frame if it was isolated before that.
    Exhausted {
        polarity: Polarity,
        activating: Option<CanMessage>,
        rounds: usize,
    },
}

/// Sends `messages` in order inside one bus session and watches `channel` for
/// `target` for up to each message's own delay after it is sent.
///
/// Returns whether the target state was observed.
pub fn replay<O, T>(
    observer: &mut O,
    transport: &mut T,
    channel: usize,
    messages: &[CanMessage],
    target: bool,
    mode: ReplayMode,
) -> Result<bool, LocalizeError>
where
    O: Observer + ?Sized,
    T: Transport + ?Sized,
{
    let mut bus = transport.session()?;
    let mut observed = false;
    for message in messages {
        bus.send(message)?;
        if observer.wait_for(channel, target, message.delay())? {
            debug!(frame = %message, target, "Target state observed");
            observed = true;
            if mode == ReplayMode::StopAtSignal {
                break;
            }
        }
    }
    Ok(observed)
}

/// Drives the bisection for one sensor channel.
pub struct Localizer<'a, O: Observer + ?Sized, T: Transport + ?Sized> {
    observer: &'a mut O,
    transport: &'a mut T,
    channel: usize,
    settings: LocalizerSettings,
    rounds: usize,
}

impl<'a, O: Observer + ?Sized, T: Transport + ?Sized> Localizer<'a, O, T> {
    pub fn new(
        observer: &'a mut O,
        transport: &'a mut T,
        channel: usize,
        settings: LocalizerSettings,
    ) -> Self {
        Self {
            observer,
            transport,
            channel,
            settings,
            rounds: 0,
        }
    }

    /// Number of probe rounds run so far. A round replays one or both halves of a frame.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Runs the search until the requested polarities are found or a stack is exhausted.
    ///
    /// Once a polarity's frame is known it is resent instead of searched again
    /// whenever the channel is in the state that frame is supposed to leave.
    pub fn localize(
        &mut self,
        corpus: &Corpus,
        mode: SearchMode,
    ) -> Result<Localization, LocalizeError> {
        if corpus.is_empty() {
            return Err(LocalizeError::EmptyCorpus);
        }
        info!(
            channel = self.channel,
            messages = corpus.len(),
            ?mode,
            "Localizing"
        );

        let mut activating_stack = FrameStack::new(corpus.len());
        let mut deactivating_stack = FrameStack::new(corpus.len());
        let mut activating: Option<CanMessage> = None;
        let mut deactivating: Option<CanMessage> = None;

        loop {
            if let Some(on) = &activating {
                if mode == SearchMode::Single || deactivating.is_some() {
                    info!(
                        activating = %on,
                        deactivating = ?deactivating.as_ref().map(ToString::to_string),
                        rounds = self.rounds,
                        "Localization finished"
                    );
                    return Ok(Localization::Found {
                        activating: on.clone(),
                        deactivating,
                        rounds: self.rounds,
                    });
                }
            }

            let active = self.observer.read_state(self.channel)?;
            let polarity = match (active, mode) {
                (false, _) => Polarity::Activating,
                (true, SearchMode::Dual) => Polarity::Deactivating,
                (true, SearchMode::Single) => {
                    debug!(channel = self.channel, "Waiting for channel to turn OFF");
                    let wait = self.settings.repeat_delay.max(self.observer.poll_interval());
                    while !self.observer.wait_for(self.channel, false, wait)? {}
                    continue;
                }
            };

            let (known, stack) = match polarity {
                Polarity::Activating => (&mut activating, &mut activating_stack),
                Polarity::Deactivating => (&mut deactivating, &mut deactivating_stack),
            };
            if let Some(message) = known.as_ref() {
                replay(
                    &mut *self.observer,
                    &mut *self.transport,
                    self.channel,
                    std::slice::from_ref(message),
                    polarity.target_state(),
                    ReplayMode::StopAtSignal,
                )?;
                continue;
            }

            match Self::step_with(
                &mut *self.observer,
                &mut *self.transport,
                self.channel,
                &self.settings,
                &mut self.rounds,
                corpus,
                stack,
                polarity,
            )? {
                StepOutcome::Found(message) => {
                    info!(%polarity, frame = %message, "Responsible frame found");
                    *known = Some(message);
                }
                StepOutcome::Exhausted => {
                    warn!(%polarity, rounds = self.rounds, "Search space exhausted");
                    return Ok(Localization::Exhausted {
                        polarity,
                        activating,
                        rounds: self.rounds,
                    });
                }
                _ => {}
            }
        }
    }

    /// Runs a single probe round against the top of `stack`.
    pub fn step(
        &mut self,
        corpus: &Corpus,
        stack: &mut FrameStack,
        polarity: Polarity,
    ) -> Result<StepOutcome, LocalizeError> {
        Self::step_with(
            &mut *self.observer,
            &mut *self.transport,
            self.channel,
            &self.settings,
            &mut self.rounds,
            corpus,
            stack,
            polarity,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn step_with(
        observer: &mut O,
        transport: &mut T,
        channel: usize,
        settings: &LocalizerSettings,
        rounds: &mut usize,
        corpus: &Corpus,
        stack: &mut FrameStack,
        polarity: Polarity,
    ) -> Result<StepOutcome, LocalizeError> {
        let frame = stack.top();
        let messages = &corpus.as_slice()[frame.range()];
        if messages.len() <= 1 {
            return match messages.first() {
                Some(message) => Ok(StepOutcome::Found(message.clone())),
                None => Err(LocalizeError::EmptyCorpus),
            };
        }

        *rounds += 1;
        let (first, second) = frame.split();
        for half in [first, second] {
            let batch = &corpus.as_slice()[half.range()];
            if probe(observer, transport, channel, settings, batch, polarity)? {
                stack.push(half);
                if let [message] = batch {
                    debug!(%polarity, frame = %message, depth = stack.depth(), "Narrowed to one frame");
                    return Ok(StepOutcome::Found(message.clone()));
                }
                debug!(
                    %polarity,
                    start = half.start,
                    end = half.end,
                    depth = stack.depth(),
                    "Narrowed"
                );
                return Ok(StepOutcome::Narrowed {
                    depth: stack.depth(),
                });
            }
        }

        if stack.retry_count >= settings.retry_threshold {
            if stack.backtrack() {
                warn!(%polarity, depth = stack.depth(), "Neither half responded, backtracking");
                return Ok(StepOutcome::Backtracked {
                    depth: stack.depth(),
                });
            }
            return Ok(StepOutcome::Exhausted);
        }
        stack.retry_count += 1;
        warn!(%polarity, count = stack.retry_count, "Neither half responded, retrying");
        Ok(StepOutcome::Retry {
            count: stack.retry_count,
        })
    }
}

/// Replays one half, grants the grace wait when it stayed silent, then settles.
fn probe<O, T>(
    observer: &mut O,
    transport: &mut T,
    channel: usize,
    settings: &LocalizerSettings,
    batch: &[CanMessage],
    polarity: Polarity,
) -> Result<bool, LocalizeError>
where
    O: Observer + ?Sized,
    T: Transport + ?Sized,
{
    let target = polarity.target_state();
    let mut found = replay(
        observer,
        transport,
        channel,
        batch,
        target,
        ReplayMode::StopAtSignal,
    )?;
    if !found {
        found = observer.wait_for(channel, target, settings.signal_delay)?;
    }
    thread::sleep(settings.repeat_delay);
    Ok(found)
}
