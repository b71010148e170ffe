use std::collections::HashSet;
use std::sync::Mutex;

use url::Url;

use crate::record::Record;
use crate::reporter::{Reporter, lock};

#[derive(Debug, Default)]
struct TrackerState {
    actives: HashSet<Url>,
    inactives: HashSet<Url>,
}

/// Remembers which targets an aggregating checker reported on, so targets
/// that disappeared between two cycles can be deactivated.
#[derive(Debug, Default)]
pub struct TargetTracker {
    state: Mutex<TrackerState>,
}

impl TargetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new cycle. Everything active in the previous cycle becomes a
    /// candidate for deactivation until it is reported again.
    pub fn prepare<'a>(&'a self, upstream: &'a dyn Reporter) -> TrackingReporter<'a> {
        let mut state = lock(&self.state);
        state.inactives = std::mem::take(&mut state.actives);
        TrackingReporter { tracker: self, upstream }
    }

    /// Targets of the previous cycle that were not reported in this one.
    pub fn inactives(&self) -> Vec<Url> {
        let state = lock(&self.state);
        let mut targets: Vec<Url> = state.inactives.iter().cloned().collect();
        targets.sort();
        targets
    }

    fn activate(&self, target: &Url) {
        let mut state = lock(&self.state);
        state.inactives.remove(target);
        state.actives.insert(target.clone());
    }
}

/// Reporter handed out for one cycle of a [`TargetTracker`].
pub struct TrackingReporter<'a> {
    tracker: &'a TargetTracker,
    upstream: &'a dyn Reporter,
}

impl Reporter for TrackingReporter<'_> {
    fn report(&self, source: &Url, record: Record) {
        self.tracker.activate(&record.target);
        self.upstream.report(source, record);
    }

    fn deactivate_target(&self, source: &Url, targets: &[Url]) {
        self.upstream.deactivate_target(source, targets);
    }
}
