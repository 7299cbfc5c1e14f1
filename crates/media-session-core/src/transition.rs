//! Resumable, step-driven state machine driver.
//!
//! A [`Transition`] drives its source object through a sequence of steps.
//! The source decides the sequence ([`Transitionable::next_step`]) and what
//! each step does ([`Transitionable::execute_step`]). A step may finish
//! synchronously or start asynchronous work; either way, the sequence only
//! continues when something calls [`Transition::advance`]. Failures go
//! through [`Transition::return_error`], which rolls the source back and
//! completes the transition.
//!
//! Advancing from inside `execute_step` does not recurse: the request is
//! queued and picked up by the loop that is already running.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use crate::{Error, ItemFeatures};

/// Opaque step identifier, allocated by each state machine.
pub type Step = u32;

/// Initial input of `next_step`, and its output once the machine is done.
pub const STEP_NONE: Step = 0;
/// Fail the transition with the attached error.
pub const STEP_ERROR: Step = 1;
/// First value available to concrete state machines.
pub const STEP_CUSTOM_START: Step = 0x10;

/// An object that can be driven by a [`Transition`].
pub trait Transitionable {
    /// Compute the step following `step`.
    ///
    /// Returning `step` itself means the machine is waiting for an
    /// asynchronous operation and nothing is executed.
    fn next_step(&self, transition: &Rc<Transition>, step: Step) -> Step;

    /// Execute `step`. Must eventually lead to `advance` or `return_error`.
    fn execute_step(&self, transition: &Rc<Transition>, step: Step);

    /// Release partially-constructed state after a failure.
    ///
    /// Called at most once per failed transition, possibly before any step
    /// was executed.
    fn rollback(&self) {}
}

/// Lifecycle of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    /// No step executed yet.
    Pending,
    /// The engine is computing or executing steps.
    Advancing,
    /// Terminal.
    Completed,
}

/// Invoked exactly once when the transition completes.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), Error>)>;

struct Inner {
    state: TransitionState,
    step: Step,
    error: Option<Error>,
    failed: bool,
    executing: bool,
    advance_requested: bool,
    executed_steps: u32,
    callback: Option<CompletionCallback>,
}

/// One in-flight feature-change request.
pub struct Transition {
    source: Weak<dyn Transitionable>,
    wanted: ItemFeatures,
    inner: RefCell<Inner>,
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Transition")
            .field("wanted", &self.wanted)
            .field("state", &inner.state)
            .field("step", &inner.step)
            .field("error", &inner.error)
            .finish_non_exhaustive()
    }
}

impl Transition {
    /// Create a pending transition. Nothing runs until [`Self::advance`].
    #[must_use]
    pub fn new(
        source: Weak<dyn Transitionable>,
        wanted: ItemFeatures,
        callback: CompletionCallback,
    ) -> Rc<Self> {
        Rc::new(Self {
            source,
            wanted,
            inner: RefCell::new(Inner {
                state: TransitionState::Pending,
                step: STEP_NONE,
                error: None,
                failed: false,
                executing: false,
                advance_requested: false,
                executed_steps: 0,
                callback: Some(callback),
            }),
        })
    }

    /// Features this transition was created to reach.
    #[must_use]
    pub const fn wanted(&self) -> ItemFeatures {
        self.wanted
    }

    /// The step currently executing or waited on.
    #[must_use]
    pub fn step(&self) -> Step {
        self.inner.borrow().step
    }

    #[must_use]
    pub fn state(&self) -> TransitionState {
        self.inner.borrow().state
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == TransitionState::Completed
    }

    /// Whether an error was attached, either pending or final.
    #[must_use]
    pub fn had_error(&self) -> bool {
        let inner = self.inner.borrow();
        inner.failed || inner.error.is_some()
    }

    /// Number of `execute_step` calls made so far.
    #[must_use]
    pub fn executed_steps(&self) -> u32 {
        self.inner.borrow().executed_steps
    }

    /// The source object, if it is still alive.
    #[must_use]
    pub fn source(&self) -> Option<Rc<dyn Transitionable>> {
        self.source.upgrade()
    }

    /// Continue the sequence.
    pub fn advance(self: &Rc<Self>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == TransitionState::Completed {
                return;
            }
            if inner.executing {
                inner.advance_requested = true;
                return;
            }
            inner.executing = true;
            inner.state = TransitionState::Advancing;
        }

        loop {
            let Some(source) = self.source.upgrade() else {
                self.inner.borrow_mut().executing = false;
                tracing::debug!("transition source dropped while advancing");
                self.fail(Error::SourceGone);
                return;
            };

            let (current, has_error) = {
                let inner = self.inner.borrow();
                (inner.step, inner.error.is_some())
            };
            let next = if has_error {
                STEP_ERROR
            } else {
                source.next_step(self, current)
            };

            match next {
                STEP_NONE => {
                    self.inner.borrow_mut().executing = false;
                    self.complete();
                    return;
                }
                STEP_ERROR => {
                    let error = {
                        let mut inner = self.inner.borrow_mut();
                        inner.executing = false;
                        inner.error.take().unwrap_or(Error::StateMachine)
                    };
                    self.fail(error);
                    return;
                }
                step if step == current => {
                    tracing::trace!(step, "transition waiting");
                    self.inner.borrow_mut().executing = false;
                    return;
                }
                step => {
                    {
                        let mut inner = self.inner.borrow_mut();
                        inner.step = step;
                        inner.executed_steps += 1;
                    }
                    tracing::trace!(step, "executing transition step");
                    source.execute_step(self, step);
                }
            }

            let mut inner = self.inner.borrow_mut();
            if inner.state == TransitionState::Completed {
                inner.executing = false;
                return;
            }
            if inner.advance_requested {
                inner.advance_requested = false;
                continue;
            }
            inner.executing = false;
            return;
        }
    }

    /// Attach an error without completing; the next advance fails.
    ///
    /// Only the first attached error is kept.
    pub fn attach_error(&self, error: Error) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == TransitionState::Completed {
            tracing::debug!(%error, "ignoring error on completed transition");
            return;
        }
        if inner.error.is_none() {
            inner.error = Some(error);
        }
    }

    /// Fail the transition now.
    pub fn return_error(self: &Rc<Self>, error: Error) {
        let error = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == TransitionState::Completed {
                tracing::debug!(%error, "ignoring error on completed transition");
                return;
            }
            inner.error.take().unwrap_or(error)
        };
        self.fail(error);
    }

    fn fail(&self, error: Error) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            inner.state = TransitionState::Completed;
            inner.failed = true;
            inner.callback.take()
        };
        tracing::debug!(%error, "transition failed");
        if let Some(source) = self.source.upgrade() {
            source.rollback();
        }
        if let Some(callback) = callback {
            callback(Err(error));
        }
    }

    fn complete(&self) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            inner.state = TransitionState::Completed;
            inner.callback.take()
        };
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    const FIRST: Step = STEP_CUSTOM_START;

    /// Linear machine with `len` steps, optionally failing at one of them.
    struct Linear {
        len: u32,
        fail_at: Option<Step>,
        async_at: Option<Step>,
        next_calls: Cell<u32>,
        executed: RefCell<Vec<Step>>,
        rollbacks: Cell<u32>,
        parked: RefCell<Option<Rc<Transition>>>,
    }

    impl Linear {
        fn new(len: u32) -> Rc<Self> {
            Rc::new(Self {
                len,
                fail_at: None,
                async_at: None,
                next_calls: Cell::new(0),
                executed: RefCell::new(Vec::new()),
                rollbacks: Cell::new(0),
                parked: RefCell::new(None),
            })
        }
    }

    impl Transitionable for Linear {
        fn next_step(&self, _transition: &Rc<Transition>, step: Step) -> Step {
            self.next_calls.set(self.next_calls.get() + 1);
            match step {
                STEP_NONE => FIRST,
                s if s + 1 < FIRST + self.len => s + 1,
                s if s < FIRST + self.len => STEP_NONE,
                _ => STEP_ERROR,
            }
        }

        fn execute_step(&self, transition: &Rc<Transition>, step: Step) {
            self.executed.borrow_mut().push(step);
            if self.fail_at == Some(step) {
                transition.return_error(Error::invariant("boom"));
            } else if self.async_at == Some(step) {
                *self.parked.borrow_mut() = Some(Rc::clone(transition));
            } else {
                transition.advance();
            }
        }

        fn rollback(&self) {
            self.rollbacks.set(self.rollbacks.get() + 1);
        }
    }

    fn start(machine: &Rc<Linear>) -> (Rc<Transition>, Rc<RefCell<Option<Result<(), Error>>>>) {
        let result = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        let source: Rc<dyn Transitionable> = machine.clone();
        let transition = Transition::new(
            Rc::downgrade(&source),
            ItemFeatures::ACTIVE,
            Box::new(move |res| {
                assert!(sink.borrow().is_none(), "callback fired twice");
                *sink.borrow_mut() = Some(res);
            }),
        );
        transition.advance();
        (transition, result)
    }

    #[test]
    fn test_linear_machine_completes_in_bounded_steps() {
        let machine = Linear::new(5);
        let (transition, result) = start(&machine);

        assert!(transition.is_completed());
        assert_eq!(*result.borrow(), Some(Ok(())));
        assert_eq!(transition.executed_steps(), 5);
        // one call per step plus the final one returning NONE
        assert_eq!(machine.next_calls.get(), 6);
        assert_eq!(*machine.executed.borrow(), (FIRST..FIRST + 5).collect::<Vec<_>>());
        assert_eq!(machine.rollbacks.get(), 0);
    }

    #[test]
    fn test_failure_rolls_back_once_and_stops() {
        let mut machine = Linear::new(4);
        Rc::get_mut(&mut machine).unwrap().fail_at = Some(FIRST + 1);
        let (transition, result) = start(&machine);

        assert!(transition.is_completed());
        assert!(transition.had_error());
        assert_eq!(
            *result.borrow(),
            Some(Err(Error::Invariant("boom".into())))
        );
        assert_eq!(*machine.executed.borrow(), vec![FIRST, FIRST + 1]);
        assert_eq!(machine.rollbacks.get(), 1);

        // further advances are ignored
        transition.advance();
        assert_eq!(machine.executed.borrow().len(), 2);
    }

    #[test]
    fn test_async_step_resumes_on_external_advance() {
        let mut machine = Linear::new(3);
        Rc::get_mut(&mut machine).unwrap().async_at = Some(FIRST + 1);
        let (transition, result) = start(&machine);

        assert_eq!(transition.state(), TransitionState::Advancing);
        assert!(result.borrow().is_none());
        assert_eq!(transition.step(), FIRST + 1);

        let parked = machine.parked.borrow_mut().take().unwrap();
        parked.advance();
        assert_eq!(*result.borrow(), Some(Ok(())));
        assert_eq!(transition.executed_steps(), 3);
    }

    #[test]
    fn test_attached_error_short_circuits_next_step() {
        let mut machine = Linear::new(3);
        Rc::get_mut(&mut machine).unwrap().async_at = Some(FIRST);
        let (transition, result) = start(&machine);
        let calls_before = machine.next_calls.get();

        transition.attach_error(Error::invariant("late"));
        assert!(transition.had_error());
        assert!(!transition.is_completed());
        transition.advance();

        assert_eq!(machine.next_calls.get(), calls_before);
        assert_eq!(*result.borrow(), Some(Err(Error::Invariant("late".into()))));
        assert_eq!(machine.rollbacks.get(), 1);
    }

    #[test]
    fn test_error_before_any_step_still_rolls_back() {
        let machine = Linear::new(2);
        let source: Rc<dyn Transitionable> = machine.clone();
        let result = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        let transition = Transition::new(
            Rc::downgrade(&source),
            ItemFeatures::ACTIVE,
            Box::new(move |res| *sink.borrow_mut() = Some(res)),
        );

        transition.return_error(Error::invariant("never started"));
        assert_eq!(transition.executed_steps(), 0);
        assert_eq!(machine.rollbacks.get(), 1);
        assert!(matches!(*result.borrow(), Some(Err(Error::Invariant(_)))));
    }

    #[test]
    fn test_dropped_source_fails_transition() {
        let mut machine = Linear::new(3);
        Rc::get_mut(&mut machine).unwrap().async_at = Some(FIRST);
        let (transition, result) = start(&machine);
        let parked = machine.parked.borrow_mut().take().unwrap();
        drop(machine);

        parked.advance();
        assert!(transition.is_completed());
        assert_eq!(*result.borrow(), Some(Err(Error::SourceGone)));
    }

    /// Waits on a flag: `next_step` keeps returning the same step.
    struct Waiter {
        ready: Cell<bool>,
        executions: Cell<u32>,
    }

    impl Transitionable for Waiter {
        fn next_step(&self, _transition: &Rc<Transition>, step: Step) -> Step {
            match step {
                STEP_NONE => FIRST,
                FIRST if self.ready.get() => STEP_NONE,
                FIRST => FIRST,
                _ => STEP_ERROR,
            }
        }

        fn execute_step(&self, _transition: &Rc<Transition>, _step: Step) {
            self.executions.set(self.executions.get() + 1);
        }
    }

    #[test]
    fn test_same_step_means_waiting() {
        let waiter = Rc::new(Waiter {
            ready: Cell::new(false),
            executions: Cell::new(0),
        });
        let source: Rc<dyn Transitionable> = waiter.clone();
        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        let transition = Transition::new(
            Rc::downgrade(&source),
            ItemFeatures::ACTIVE,
            Box::new(move |res| flag.set(res.is_ok())),
        );

        transition.advance();
        transition.advance();
        transition.advance();
        assert_eq!(waiter.executions.get(), 1);
        assert!(!transition.is_completed());

        waiter.ready.set(true);
        transition.advance();
        assert!(done.get());
        assert_eq!(waiter.executions.get(), 1);
    }
}
