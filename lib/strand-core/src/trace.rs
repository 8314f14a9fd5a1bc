//! Execution tracing.
//!
//! When tracing is enabled, every fiber records the user-facing steps it evaluates (pure values, suspended thunks,
//! transformations, sequencing, asynchronous boundaries, and resource acquisition and release) into a bounded ring
//! buffer, tagged with the source location that built the step. Only the most recent frames are retained, along with
//! counts of how many were captured and how many were pushed out.
use std::{collections::VecDeque, panic::Location};

/// The kind of step a trace frame was recorded for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TraceKind {
    /// A pure value.
    Pure,

    /// A suspended synchronous thunk.
    Delay,

    /// A transformation of a produced value.
    Map,

    /// Sequencing into a dependent effect.
    Bind,

    /// An asynchronous boundary.
    Async,

    /// Resource acquisition.
    Acquire,

    /// Resource release.
    Release,
}

/// A single recorded step.
#[derive(Clone, Copy, Debug)]
pub struct TraceFrame {
    kind: TraceKind,
    location: &'static Location<'static>,
}

impl TraceFrame {
    pub(crate) fn new(kind: TraceKind, location: &'static Location<'static>) -> Self {
        Self { kind, location }
    }

    /// Returns the kind of step.
    pub fn kind(&self) -> TraceKind {
        self.kind
    }

    /// Returns the source location that built the step.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

/// A snapshot of a fiber's trace buffer.
#[derive(Clone, Debug, Default)]
pub struct FiberTrace {
    captured: u64,
    omitted: u64,
    frames: Vec<TraceFrame>,
}

impl FiberTrace {
    /// Returns the total number of frames recorded over the life of the fiber.
    pub fn captured(&self) -> u64 {
        self.captured
    }

    /// Returns the number of frames evicted from the buffer.
    pub fn omitted(&self) -> u64 {
        self.omitted
    }

    /// Returns the retained frames, oldest first.
    pub fn frames(&self) -> &[TraceFrame] {
        &self.frames
    }

    /// Returns the number of retained frames of the given kind.
    pub fn count_of(&self, kind: TraceKind) -> usize {
        self.frames.iter().filter(|frame| frame.kind == kind).count()
    }
}

/// Bounded ring buffer of trace frames owned by a single run-loop.
pub(crate) struct TraceBuffer {
    frames: VecDeque<TraceFrame>,
    capacity: usize,
    captured: u64,
    omitted: u64,
}

impl TraceBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            captured: 0,
            omitted: 0,
        }
    }

    pub(crate) fn push(&mut self, frame: TraceFrame) {
        self.captured += 1;
        if self.capacity == 0 {
            self.omitted += 1;
            return;
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.omitted += 1;
        }
        self.frames.push_back(frame);
    }

    pub(crate) fn snapshot(&self) -> FiberTrace {
        FiberTrace {
            captured: self.captured,
            omitted: self.omitted,
            frames: self.frames.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: TraceKind) -> TraceFrame {
        TraceFrame::new(kind, Location::caller())
    }

    #[test]
    fn retains_most_recent_frames() {
        let mut buffer = TraceBuffer::new(2);
        buffer.push(frame(TraceKind::Pure));
        buffer.push(frame(TraceKind::Map));
        buffer.push(frame(TraceKind::Bind));

        let trace = buffer.snapshot();
        assert_eq!(trace.captured(), 3);
        assert_eq!(trace.omitted(), 1);
        let kinds = trace.frames().iter().map(TraceFrame::kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![TraceKind::Map, TraceKind::Bind]);
    }

    #[test]
    fn zero_capacity_omits_everything() {
        let mut buffer = TraceBuffer::new(0);
        buffer.push(frame(TraceKind::Delay));

        let trace = buffer.snapshot();
        assert_eq!(trace.captured(), 1);
        assert_eq!(trace.omitted(), 1);
        assert!(trace.frames().is_empty());
    }

    #[test]
    fn counts_by_kind() {
        let mut buffer = TraceBuffer::new(8);
        buffer.push(frame(TraceKind::Pure));
        buffer.push(frame(TraceKind::Map));
        buffer.push(frame(TraceKind::Map));

        let trace = buffer.snapshot();
        assert_eq!(trace.count_of(TraceKind::Map), 2);
        assert_eq!(trace.count_of(TraceKind::Async), 0);
    }
}
