//! In-memory stand-in for a bus-connected target with indicator lamps.

use crate::message::CanMessage;
use crate::observer::{Observer, SensorError};
use crate::transport::{Transport, TransportError};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

type Trigger = Box<dyn Fn(&CanMessage) -> bool>;

/// One observable channel of the simulated target.
pub(crate) struct Lamp {
    on_when: Trigger,
    off_when: Option<Trigger>,
    hold_reads: Option<usize>,
    miss_first: usize,
    max_activations: Option<usize>,
    active: bool,
    remaining_reads: usize,
    triggers_seen: usize,
    activations: usize,
}

impl Lamp {
    fn with_triggers(on_when: Trigger, off_when: Option<Trigger>, hold_reads: Option<usize>) -> Self {
        Self {
            on_when,
            off_when,
            hold_reads,
            miss_first: 0,
            max_activations: None,
            active: false,
            remaining_reads: 0,
            triggers_seen: 0,
            activations: 0,
        }
    }

    /// Turns ON when a matching frame is sent and OFF again after one read.
    pub(crate) fn momentary(on_when: impl Fn(&CanMessage) -> bool + 'static) -> Self {
        Self::with_triggers(Box::new(on_when), None, Some(1))
    }

    /// Stays ON until a frame matching `off_when` is sent.
    pub(crate) fn latched(
        on_when: impl Fn(&CanMessage) -> bool + 'static,
        off_when: impl Fn(&CanMessage) -> bool + 'static,
    ) -> Self {
        Self::with_triggers(Box::new(on_when), Some(Box::new(off_when)), None)
    }

    /// Number of reads the lamp stays ON for after activating.
    pub(crate) fn hold_reads(mut self, reads: usize) -> Self {
        self.hold_reads = Some(reads.max(1));
        self
    }

    /// Ignores the first `count` matching frames.
    pub(crate) fn miss_first(mut self, count: usize) -> Self {
        self.miss_first = count;
        self
    }

    pub(crate) fn max_activations(mut self, count: usize) -> Self {
        self.max_activations = Some(count);
        self
    }

    fn on_frame(&mut self, message: &CanMessage) {
        if let Some(off_when) = &self.off_when {
            if off_when(message) {
                self.active = false;
            }
        }
        if !(self.on_when)(message) {
            return;
        }
        self.triggers_seen += 1;
        if self.triggers_seen <= self.miss_first {
            return;
        }
        if self.max_activations.is_some_and(|max| self.activations >= max) {
            return;
        }
        self.active = true;
        self.activations += 1;
        self.remaining_reads = self.hold_reads.unwrap_or(0);
    }

    fn read(&mut self) -> bool {
        let state = self.active;
        if state && self.hold_reads.is_some() {
            self.remaining_reads = self.remaining_reads.saturating_sub(1);
            if self.remaining_reads == 0 {
                self.active = false;
            }
        }
        state
    }
}

#[derive(Default)]
struct SimState {
    lamps: Vec<Lamp>,
    sent: Vec<CanMessage>,
    acquired: bool,
    acquisitions: usize,
    releases: usize,
    reads: usize,
}

/// Shared handle; observers and transports built from it see the same lamps.
#[derive(Clone, Default)]
pub(crate) struct SimTarget {
    state: Rc<RefCell<SimState>>,
}

impl SimTarget {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a lamp as the next channel.
    pub(crate) fn with_lamp(self, lamp: Lamp) -> Self {
        self.state.borrow_mut().lamps.push(lamp);
        self
    }

    pub(crate) fn observer(&self) -> SimObserver {
        SimObserver {
            state: Rc::clone(&self.state),
        }
    }

    pub(crate) fn transport(&self) -> SimTransport {
        SimTransport {
            state: Rc::clone(&self.state),
        }
    }

    pub(crate) fn sent(&self) -> Vec<CanMessage> {
        self.state.borrow().sent.clone()
    }

    pub(crate) fn sent_ids(&self) -> Vec<u32> {
        self.state.borrow().sent.iter().map(CanMessage::arb_id).collect()
    }

    pub(crate) fn acquisitions(&self) -> usize {
        self.state.borrow().acquisitions
    }

    pub(crate) fn releases(&self) -> usize {
        self.state.borrow().releases
    }

    pub(crate) fn is_acquired(&self) -> bool {
        self.state.borrow().acquired
    }

    pub(crate) fn reads(&self) -> usize {
        self.state.borrow().reads
    }
}

pub(crate) struct SimObserver {
    state: Rc<RefCell<SimState>>,
}

impl Observer for SimObserver {
    fn name(&self) -> &'static str {
        "SimObserver"
    }

    fn channel_count(&self) -> usize {
        self.state.borrow().lamps.len()
    }

    fn read_state(&mut self, channel: usize) -> Result<bool, SensorError> {
        let mut state = self.state.borrow_mut();
        state.reads += 1;
        let available = state.lamps.len();
        state
            .lamps
            .get_mut(channel)
            .map(Lamp::read)
            .ok_or(SensorError::UnknownChannel { channel, available })
    }

    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }
}

pub(crate) struct SimTransport {
    state: Rc<RefCell<SimState>>,
}

impl Transport for SimTransport {
    fn name(&self) -> &'static str {
        "SimTransport"
    }

    fn acquire(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        state.acquired = true;
        state.acquisitions += 1;
        Ok(())
    }

    fn send(&mut self, message: &CanMessage) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if !state.acquired {
            return Err(TransportError::NotAcquired(self.name()));
        }
        state.sent.push(message.clone());
        for lamp in state.lamps.iter_mut() {
            lamp.on_frame(message);
        }
        Ok(())
    }

    fn release(&mut self) {
        let mut state = self.state.borrow_mut();
        state.acquired = false;
        state.releases += 1;
    }
}
