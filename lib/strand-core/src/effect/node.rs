use std::{
    any::{type_name, Any},
    cell::RefCell,
    mem,
    panic::Location,
};

use strand_error::generic_error;

use super::Poll;
use crate::{
    runtime::{FiberEnv, ResumeCallback},
    trace::TraceKind,
    EffectError,
};

/// A type-erased value flowing through the run-loop.
pub(crate) type Value = Box<dyn Any + Send>;

/// The source location that built a node, when it should be traced.
pub(crate) type Site = Option<&'static Location<'static>>;

pub(crate) type Thunk = Box<dyn FnOnce() -> Result<Value, EffectError> + Send>;
pub(crate) type MapFn = Box<dyn FnOnce(Value) -> Result<Value, EffectError> + Send>;
pub(crate) type BindFn = Box<dyn FnOnce(Value) -> Node + Send>;
pub(crate) type RecoverFn = Box<dyn FnOnce(EffectError) -> Node + Send>;
pub(crate) type RegisterFn = Box<dyn FnOnce(ResumeCallback) -> Option<Node> + Send>;
pub(crate) type MaskedFn = Box<dyn FnOnce(Poll) -> Node + Send>;
pub(crate) type EnvFn = Box<dyn for<'a> FnOnce(&FiberEnv<'a>) -> Node + Send>;

/// The shape of a node in the description tree.
pub(crate) enum NodeKind {
    /// An already-computed value.
    Pure(Value, Site),

    /// A failure.
    RaiseError(EffectError),

    /// A synchronous thunk.
    Delay(Thunk, Site),

    /// A node built lazily at evaluation time.
    Defer(Box<dyn FnOnce() -> Node + Send>),

    /// Transforms the value produced by the source.
    Map(Box<Node>, MapFn, Site),

    /// Continues with a node built from the value produced by the source.
    Bind(Box<Node>, BindFn, Site),

    /// Recovers from a failure of the source.
    HandleErrorWith(Box<Node>, RecoverFn),

    /// Suspends the fiber until the registered callback is invoked.
    Async(RegisterFn, Site),

    /// Evaluates the source with cancelability restored, if the fiber is still at the given mask depth.
    Unmask(Box<Node>, u32),

    /// Evaluates the body with cancellation masked.
    Uncancelable(MaskedFn),

    /// Evaluates the body with a finalizer that runs only if the fiber is canceled while the body runs.
    OnCancel(Box<Node>, Box<Node>),

    /// Requests cancellation of the current fiber.
    Canceled,

    /// Yields back to the scheduler.
    Cede,

    /// Builds a node from the fiber's environment.
    Env(EnvFn),

    /// Records a trace frame of the given kind before evaluating the source.
    Trace(Box<Node>, TraceKind, &'static Location<'static>),
}

/// The untyped description tree evaluated by the run-loop.
///
/// Dropping a tree is iterative: nested nodes, including those captured by continuations, are queued on a per-thread
/// work list rather than dropped recursively, so discarding a deep tree never exhausts the native stack.
pub(crate) struct Node(NodeKind);

impl Node {
    pub(crate) fn unit() -> Self {
        Node(NodeKind::Pure(Box::new(()), None))
    }

    pub(crate) fn into_kind(mut self) -> NodeKind {
        mem::replace(&mut self.0, NodeKind::Canceled)
    }
}

impl From<NodeKind> for Node {
    fn from(kind: NodeKind) -> Self {
        Node(kind)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if matches!(
            self.0,
            NodeKind::Pure(..) | NodeKind::RaiseError(_) | NodeKind::Canceled | NodeKind::Cede
        ) {
            return;
        }
        dispose(mem::replace(&mut self.0, NodeKind::Canceled));
    }
}

thread_local! {
    /// Nodes waiting to be dropped by the drain running on this thread, if any.
    static DISPOSAL: RefCell<Option<Vec<NodeKind>>> = const { RefCell::new(None) };
}

fn dispose(kind: NodeKind) {
    // Hands the node back when no drain is running yet, making this call the drain.
    let first = DISPOSAL.try_with(move |disposal| {
        let mut disposal = disposal.borrow_mut();
        match disposal.as_mut() {
            Some(queue) => {
                queue.push(kind);
                None
            }
            None => {
                *disposal = Some(Vec::new());
                Some(kind)
            }
        }
    });
    let Ok(Some(first)) = first else {
        return;
    };

    let _drain = DrainGuard;
    let mut next = Some(first);
    while let Some(kind) = next {
        drop(kind);
        next = DISPOSAL
            .try_with(|disposal| disposal.borrow_mut().as_mut().and_then(Vec::pop))
            .ok()
            .flatten();
    }
}

/// Ends the drain on this thread, even if dropping a value panicked.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let leftover = DISPOSAL.try_with(|disposal| disposal.borrow_mut().take());
        drop(leftover);
    }
}

/// Recovers a concrete value from the run-loop.
pub(crate) fn unbox<A: 'static>(value: Value) -> Result<A, EffectError> {
    value.downcast::<A>().map(|value| *value).map_err(|_| {
        EffectError::from(generic_error!(
            "Effect produced a value that is not of the expected type '{}'.",
            type_name::<A>()
        ))
    })
}
