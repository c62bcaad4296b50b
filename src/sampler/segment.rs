use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::seconds_between;

/// One timed node of a transaction trace. `entry`/`exit` are seconds
/// relative to the start of the sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub metric_name: String,
    pub entry: f64,
    pub exit: f64,
    pub children: Vec<Segment>,
}

impl Segment {
    fn open(metric_name: impl Into<String>, entry: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            entry,
            exit: entry,
            children: Vec::new(),
        }
    }

    pub fn duration(&self) -> f64 {
        (self.exit - self.entry).max(0.0)
    }

    /// Time not covered by direct children.
    pub fn exclusive_duration(&self) -> f64 {
        let children: f64 = self.children.iter().map(Segment::duration).sum();
        (self.duration() - children).max(0.0)
    }

    /// Number of segments in this subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Segment::count).sum::<usize>()
    }
}

/// Builds the call tree of one in-progress request.
///
/// Owned by the request context, so no locking is involved while the
/// request runs.
#[derive(Debug)]
pub struct SampleBuilder {
    started_at: DateTime<Utc>,
    root: Segment,
    /// Open segments below the root, innermost last.
    stack: Vec<Segment>,
}

impl SampleBuilder {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            root: Segment::open("ROOT", 0.0),
            stack: Vec::new(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn push_scope(&mut self, metric_name: impl Into<String>, at: DateTime<Utc>) {
        let entry = self.offset(at);
        self.stack.push(Segment::open(metric_name, entry));
    }

    /// Close the innermost open segment and return it (also attached to its
    /// parent). Popping with nothing open is a no-op.
    pub fn pop_scope(&mut self, at: DateTime<Utc>) -> Option<Segment> {
        let mut segment = self.stack.pop()?;
        segment.exit = self.offset(at).max(segment.entry);
        self.parent_mut().children.push(segment.clone());
        Some(segment)
    }

    /// Close everything still open and return the finished root.
    pub(crate) fn finish(mut self, at: DateTime<Utc>) -> (Segment, f64) {
        while self.pop_scope(at).is_some() {}
        let duration = self.offset(at).max(0.0);
        self.root.exit = duration;
        (self.root, duration)
    }

    fn parent_mut(&mut self) -> &mut Segment {
        match self.stack.last_mut() {
            Some(open) => open,
            None => &mut self.root,
        }
    }

    fn offset(&self, at: DateTime<Utc>) -> f64 {
        seconds_between(self.started_at, at)
    }
}
