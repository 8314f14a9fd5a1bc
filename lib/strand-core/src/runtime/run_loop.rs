use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use tracing::{debug, trace};

use super::{cancel::Rejected, FiberEnv, ForwardCancelable};
use crate::{
    effect::{
        node::{BindFn, MapFn, Node, NodeKind, RecoverFn, RegisterFn, Site, Value},
        Poll,
    },
    fiber::FiberCore,
    sync::lock,
    trace::{FiberTrace, TraceBuffer, TraceFrame, TraceKind},
    EffectError, FiberError, Io, Outcome,
};

/// Receives the outcome of a fiber, along with its final trace when tracing is enabled.
pub(crate) type Completion = Box<dyn FnOnce(Outcome<Value>, Option<FiberTrace>) + Send>;

/// A continuation waiting on the continuation stack.
enum Frame {
    Map(MapFn),
    Bind(BindFn),
    Recover(RecoverFn),
    /// Restores the mask depth in effect before an uncancelable region or poll.
    Restore(u32),
    /// Unregisters the innermost cancellation finalizer.
    PopFinalizer,
}

/// What the run-loop evaluates next.
pub(crate) enum Step {
    Eval(Node),
    Value(Value),
    Error(EffectError),
}

enum Action {
    Continue(Step),
    Suspend(RegisterFn),
    Cede(Step),
    Complete(Outcome<Value>),
}

/// A parked run-loop waiting on an asynchronous boundary.
///
/// Whoever takes the run-loop out first owns the fiber from then on: the resume callback if the operation completes,
/// or the canceler if the boundary is cancelable and cancellation wins.
pub(crate) struct Suspension {
    run_loop: Mutex<Option<Box<RunLoop>>>,
    cancelable: bool,
    cancel_token: ForwardCancelable,
}

impl Suspension {
    pub(crate) fn is_cancelable(&self) -> bool {
        self.cancelable
    }

    pub(crate) fn cancel_token(&self) -> &ForwardCancelable {
        &self.cancel_token
    }

    pub(crate) fn take_run_loop(&self) -> Option<Box<RunLoop>> {
        lock(&self.run_loop).take()
    }
}

/// Resumes a run-loop parked at an asynchronous boundary.
pub(crate) struct ResumeCallback {
    core: Arc<FiberCore>,
    suspension: Arc<Suspension>,
}

impl ResumeCallback {
    pub(crate) fn resume(self, result: Result<Value, EffectError>) {
        match self.suspension.take_run_loop() {
            Some(run_loop) => {
                self.core.clear_suspension();
                self.suspension.cancel_token.dismiss();
                self.core
                    .runtime()
                    .scheduler()
                    .execute(Box::new(move || run_loop.resume(result)));
            }
            None => {
                // Either the fiber was canceled while suspended, or the callback was invoked twice.
                if let Err(e) = result {
                    self.core.runtime().scheduler().report_failure(&e);
                }
            }
        }
    }
}

/// The trampolined interpreter driving a single fiber.
pub(crate) struct RunLoop {
    core: Arc<FiberCore>,
    stack: Vec<Frame>,
    masks: u32,
    finalizers: Vec<Node>,
    canceling: bool,
    trace: Option<TraceBuffer>,
    iterations: usize,
    auto_yield_threshold: usize,
    completion: Option<Completion>,
}

impl RunLoop {
    /// Schedules a new run-loop evaluating `node` on behalf of the fiber behind `core`.
    pub(crate) fn start(core: Arc<FiberCore>, node: Node, completion: Completion) {
        let config = core.runtime().config();
        let trace = config
            .tracing_enabled()
            .then(|| TraceBuffer::new(config.trace_buffer_capacity()));
        let mut run_loop = Box::new(RunLoop {
            auto_yield_threshold: config.auto_yield_threshold(),
            core: Arc::clone(&core),
            stack: Vec::new(),
            masks: 0,
            finalizers: Vec::new(),
            canceling: false,
            trace,
            iterations: 0,
            completion: Some(completion),
        });

        core.runtime().scheduler().execute(Box::new(move || {
            let step = if run_loop.cancel_observable() {
                run_loop.begin_cancel()
            } else {
                Step::Eval(node)
            };
            run_loop.run(step);
        }));
    }

    fn run(mut self: Box<Self>, mut step: Step) {
        let span = self.core.span().clone();
        let _entered = span.enter();

        loop {
            let action = match step {
                Step::Eval(node) => self.eval(node),
                Step::Value(value) => self.on_value(value),
                Step::Error(e) => self.on_error(e),
            };

            step = match action {
                Action::Continue(next) => next,
                Action::Suspend(register) => return self.suspend(register),
                Action::Cede(next) => return self.cede(next),
                Action::Complete(outcome) => return self.complete(outcome),
            };

            self.iterations += 1;
            if self.iterations >= self.auto_yield_threshold {
                self.iterations = 0;
                if self.cancel_observable() {
                    step = self.begin_cancel();
                } else {
                    return self.cede(step);
                }
            }
        }
    }

    fn eval(&mut self, node: Node) -> Action {
        match node.into_kind() {
            NodeKind::Pure(value, site) => {
                self.record(TraceKind::Pure, site);
                Action::Continue(Step::Value(value))
            }
            NodeKind::RaiseError(e) => Action::Continue(Step::Error(e)),
            NodeKind::Delay(thunk, site) => {
                self.record(TraceKind::Delay, site);
                match guarded(thunk) {
                    Ok(Ok(value)) => Action::Continue(Step::Value(value)),
                    Ok(Err(e)) | Err(e) => Action::Continue(Step::Error(e)),
                }
            }
            NodeKind::Defer(build) => Action::Continue(match guarded(build) {
                Ok(node) => Step::Eval(node),
                Err(e) => Step::Error(e),
            }),
            NodeKind::Map(source, map, site) => {
                self.record(TraceKind::Map, site);
                self.stack.push(Frame::Map(map));
                Action::Continue(Step::Eval(*source))
            }
            NodeKind::Bind(source, bind, site) => {
                self.record(TraceKind::Bind, site);
                self.stack.push(Frame::Bind(bind));
                Action::Continue(Step::Eval(*source))
            }
            NodeKind::HandleErrorWith(source, recover) => {
                self.stack.push(Frame::Recover(recover));
                Action::Continue(Step::Eval(*source))
            }
            NodeKind::Async(register, site) => {
                self.record(TraceKind::Async, site);
                Action::Suspend(register)
            }
            NodeKind::Unmask(source, depth) => {
                if self.masks == depth && !self.canceling {
                    self.stack.push(Frame::Restore(self.masks));
                    self.masks = depth - 1;
                    if self.cancel_observable() {
                        return Action::Continue(self.begin_cancel());
                    }
                }
                Action::Continue(Step::Eval(*source))
            }
            NodeKind::Uncancelable(body) => {
                self.stack.push(Frame::Restore(self.masks));
                self.masks += 1;
                let poll = Poll::new(self.masks);
                Action::Continue(match guarded(move || body(poll)) {
                    Ok(node) => Step::Eval(node),
                    Err(e) => Step::Error(e),
                })
            }
            NodeKind::OnCancel(body, finalizer) => {
                self.finalizers.push(*finalizer);
                self.stack.push(Frame::PopFinalizer);
                Action::Continue(Step::Eval(*body))
            }
            NodeKind::Canceled => {
                self.core.mark_canceled();
                if self.cancel_observable() {
                    Action::Continue(self.begin_cancel())
                } else {
                    Action::Continue(Step::Value(Box::new(())))
                }
            }
            NodeKind::Cede => Action::Cede(Step::Value(Box::new(()))),
            NodeKind::Env(build) => {
                let env = FiberEnv {
                    runtime: self.core.runtime(),
                    fiber_id: self.core.id(),
                    trace: self.trace.as_ref(),
                };
                Action::Continue(match guarded(|| build(&env)) {
                    Ok(node) => Step::Eval(node),
                    Err(e) => Step::Error(e),
                })
            }
            NodeKind::Trace(source, kind, location) => {
                self.record(kind, Some(location));
                Action::Continue(Step::Eval(*source))
            }
        }
    }

    fn on_value(&mut self, value: Value) -> Action {
        let Some(frame) = self.stack.pop() else {
            return Action::Complete(self.terminal(Outcome::Succeeded(value)));
        };

        match frame {
            Frame::Map(map) => Action::Continue(match guarded(move || map(value)) {
                Ok(Ok(value)) => Step::Value(value),
                Ok(Err(e)) | Err(e) => Step::Error(e),
            }),
            Frame::Bind(bind) => Action::Continue(match guarded(move || bind(value)) {
                Ok(node) => Step::Eval(node),
                Err(e) => Step::Error(e),
            }),
            Frame::Recover(_) => Action::Continue(Step::Value(value)),
            Frame::Restore(masks) => {
                self.masks = masks;
                if self.cancel_observable() {
                    Action::Continue(self.begin_cancel())
                } else {
                    Action::Continue(Step::Value(value))
                }
            }
            Frame::PopFinalizer => {
                self.finalizers.pop();
                Action::Continue(Step::Value(value))
            }
        }
    }

    fn on_error(&mut self, e: EffectError) -> Action {
        loop {
            let Some(frame) = self.stack.pop() else {
                return Action::Complete(self.terminal(Outcome::Errored(e)));
            };

            match frame {
                Frame::Map(_) | Frame::Bind(_) => {}
                Frame::Recover(recover) => {
                    return Action::Continue(match guarded(move || recover(e)) {
                        Ok(node) => Step::Eval(node),
                        Err(e) => Step::Error(e),
                    })
                }
                Frame::Restore(masks) => {
                    self.masks = masks;
                    if self.cancel_observable() {
                        return Action::Continue(self.begin_cancel());
                    }
                }
                Frame::PopFinalizer => {
                    self.finalizers.pop();
                }
            }
        }
    }

    /// A canceled fiber terminates as canceled, whatever its finalizers produced.
    fn terminal(&self, outcome: Outcome<Value>) -> Outcome<Value> {
        if self.canceling {
            Outcome::Canceled
        } else {
            outcome
        }
    }

    fn cancel_observable(&self) -> bool {
        self.masks == 0 && !self.canceling && self.core.is_cancel_requested()
    }

    /// Abandons the current continuation and runs every registered finalizer, most recent first.
    fn begin_cancel(&mut self) -> Step {
        self.canceling = true;
        self.masks += 1;
        self.stack.clear();

        let finalizers = std::mem::take(&mut self.finalizers);
        debug!(fiber_id = %self.core.id(), finalizers = finalizers.len(), "Fiber canceled, running finalizers.");

        let runtime = self.core.runtime().clone();
        let mut chain = Node::unit();
        for finalizer in finalizers {
            let runtime = runtime.clone();
            let reported = Io::<()>::from_node(finalizer).handle_error_with(move |e| {
                runtime.scheduler().report_failure(&e);
                Io::unit()
            });
            chain = Node::from(NodeKind::Bind(Box::new(reported.into_node()), Box::new(move |_| chain), None));
        }
        Step::Eval(chain)
    }

    fn record(&mut self, kind: TraceKind, site: Site) {
        if let (Some(buffer), Some(location)) = (self.trace.as_mut(), site) {
            buffer.push(TraceFrame::new(kind, location));
        }
    }

    fn suspend(self: Box<Self>, register: RegisterFn) {
        let core = Arc::clone(&self.core);
        let cancelable = self.masks == 0 && !self.canceling;
        let suspension = Arc::new(Suspension {
            run_loop: Mutex::new(Some(self)),
            cancelable,
            cancel_token: ForwardCancelable::new(),
        });
        core.set_suspension(&suspension);

        // A cancellation requested before the suspension became visible would otherwise be missed.
        if cancelable && core.is_cancel_requested() {
            if let Some(run_loop) = suspension.take_run_loop() {
                core.clear_suspension();
                core.runtime()
                    .scheduler()
                    .execute(Box::new(move || run_loop.resume_canceled(None)));
            }
            return;
        }

        let callback = ResumeCallback {
            core: Arc::clone(&core),
            suspension: Arc::clone(&suspension),
        };
        let cancel_action = match guarded(move || register(callback)) {
            Ok(action) => action,
            Err(e) => {
                if let Some(run_loop) = suspension.take_run_loop() {
                    core.clear_suspension();
                    core.runtime()
                        .scheduler()
                        .execute(Box::new(move || run_loop.resume(Err(e))));
                }
                return;
            }
        };

        if let Some(action) = cancel_action {
            if let Err(Rejected::Canceled(action)) = suspension.cancel_token.complete_node(action) {
                // Cancellation raced ahead of registration, so nobody else will run the action.
                let action = Io::<()>::from_node(action);
                core.runtime().run_and_forget(Io::uncancelable(move |_| action));
            }
        }
    }

    fn resume(mut self: Box<Self>, result: Result<Value, EffectError>) {
        let step = if self.cancel_observable() {
            self.begin_cancel()
        } else {
            match result {
                Ok(value) => Step::Value(value),
                Err(e) => Step::Error(e),
            }
        };
        self.run(step);
    }

    pub(crate) fn resume_canceled(mut self: Box<Self>, cancel_action: Option<Node>) {
        if let Some(action) = cancel_action {
            self.finalizers.push(action);
        }
        let step = self.begin_cancel();
        self.run(step);
    }

    fn cede(self: Box<Self>, step: Step) {
        let scheduler = Arc::clone(self.core.runtime().scheduler());
        scheduler.execute(Box::new(move || {
            let mut run_loop = self;
            let step = if run_loop.cancel_observable() {
                run_loop.begin_cancel()
            } else {
                step
            };
            run_loop.run(step);
        }));
    }

    fn complete(mut self: Box<Self>, outcome: Outcome<Value>) {
        trace!(fiber_id = %self.core.id(), canceled = outcome.is_canceled(), "Fiber terminated.");
        let trace = self.trace.as_ref().map(TraceBuffer::snapshot);
        if let Some(completion) = self.completion.take() {
            completion(outcome, trace);
        }
    }
}

/// Runs user code, converting a panic into an error.
fn guarded<T, F>(f: F) -> Result<T, EffectError>
where
    F: FnOnce() -> T,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        EffectError::new(FiberError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_converts_panics() {
        let result: Result<(), _> = guarded(|| panic!("fiber {} broke", 3));
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FiberError>(),
            Some(FiberError::Panicked { message }) if message == "fiber 3 broke"
        ));
    }

    #[test]
    fn guarded_passes_values_through() {
        assert_eq!(guarded(|| 5).unwrap(), 5);
    }
}
