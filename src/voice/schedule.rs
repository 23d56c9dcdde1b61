//! Gapless playback scheduling.
//!
//! Fragments are laid back-to-back on the output clock: each one starts at
//! `max(now, next_start)` and pushes `next_start` forward by its duration.
//! An interruption empties the pending set and pulls the cursor back to
//! `now`, so the next reply starts immediately instead of after the audio
//! that was cut off.

use std::collections::BTreeMap;

use super::events::FragmentId;

/// Where a fragment landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledFragment {
    pub id: FragmentId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledFragment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlaybackSchedule {
    next_start: f64,
    pending: BTreeMap<FragmentId, ScheduledFragment>,
    next_id: FragmentId,
}

impl PlaybackSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest time the next fragment may begin.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: FragmentId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Place a fragment of `duration` seconds given the clock reading `now`.
    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledFragment {
        let id = self.next_id;
        self.next_id += 1;

        let start = now.max(self.next_start);
        let fragment = ScheduledFragment {
            id,
            start,
            duration: duration.max(0.0),
        };
        self.next_start = fragment.end();
        self.pending.insert(id, fragment);
        fragment
    }

    /// Forget a fragment that finished on its own. Returns `false` if it was
    /// not pending (already interrupted, or unknown).
    pub fn finish(&mut self, id: FragmentId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Cut off everything pending. Returns the ids that must be stopped.
    pub fn interrupt(&mut self, now: f64) -> Vec<FragmentId> {
        let ids = self.drain();
        self.next_start = now;
        ids
    }

    /// Empty the pending set without touching the cursor (teardown).
    pub fn drain(&mut self) -> Vec<FragmentId> {
        let ids: Vec<_> = self.pending.keys().copied().collect();
        self.pending.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn back_to_back_without_gaps() {
        let mut s = PlaybackSchedule::new();
        let a = s.schedule(0.0, 1.0);
        let b = s.schedule(0.1, 0.5);
        let c = s.schedule(0.2, 0.8);

        assert!(approx(a.start, 0.0));
        assert!(approx(b.start, a.end()));
        assert!(approx(c.start, b.end()));
        assert!(approx(c.end() - a.start, 2.3));
        assert!(approx(s.next_start(), 2.3));
        assert_eq!(s.pending_len(), 3);
    }

    #[test]
    fn clock_overtaking_cursor_starts_at_now() {
        let mut s = PlaybackSchedule::new();
        let a = s.schedule(0.0, 0.5);
        // Underrun: the clock is past the end of the last fragment.
        let b = s.schedule(2.0, 0.5);
        assert!(b.start >= a.end());
        assert!(approx(b.start, 2.0));
        assert!(approx(s.next_start(), 2.5));
    }

    #[test]
    fn finished_fragments_leave_the_set() {
        let mut s = PlaybackSchedule::new();
        let a = s.schedule(0.0, 1.0);
        let b = s.schedule(0.0, 1.0);
        assert!(s.finish(a.id));
        assert!(!s.finish(a.id));
        assert!(s.is_pending(b.id));
        assert_eq!(s.pending_len(), 1);
    }

    #[test]
    fn interrupt_clears_and_resets_cursor_to_now() {
        let mut s = PlaybackSchedule::new();
        let a = s.schedule(0.0, 1.0);
        let b = s.schedule(0.0, 0.5);
        let stopped = s.interrupt(1.2);

        assert_eq!(stopped, vec![a.id, b.id]);
        assert_eq!(s.pending_len(), 0);
        assert!(approx(s.next_start(), 1.2));

        let c = s.schedule(1.2, 0.8);
        assert!(approx(c.start, 1.2));
        assert!(c.id > b.id);
    }

    #[test]
    fn interrupt_after_natural_end_only_returns_live_fragments() {
        let mut s = PlaybackSchedule::new();
        let a = s.schedule(0.0, 1.0);
        let b = s.schedule(0.0, 0.5);
        s.finish(a.id);
        assert_eq!(s.interrupt(1.1), vec![b.id]);
    }

    #[test]
    fn drain_keeps_cursor() {
        let mut s = PlaybackSchedule::new();
        s.schedule(0.0, 1.0);
        assert_eq!(s.drain().len(), 1);
        assert!(approx(s.next_start(), 1.0));
    }

    #[test]
    fn negative_duration_is_treated_as_empty() {
        let mut s = PlaybackSchedule::new();
        let a = s.schedule(0.5, -1.0);
        assert!(approx(a.duration, 0.0));
        assert!(approx(s.next_start(), 0.5));
    }
}
