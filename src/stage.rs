//! Per-run transformation state for intermediate stages.
//!
//! A [`Stage`] in the graph is a reusable description; an [`Operator`] is
//! the mutable state one run builds from it. Skip counters, drop-while
//! latches, distinct seen-sets and buffers all live here, so every run
//! starts from scratch.

use crate::backpressure::RefillController;
use crate::buffer::{OverflowPolicy, StageBuffer};
use crate::config::EngineConfig;
use crate::demand::DemandTracker;
use crate::error::StreamError;
use crate::graph::{
    ElementIter, ErrorHookFn, FlatMapFn, FlatMapIterFn, HookFn, MapFn, PeekFn, PredicateFn,
    SeenFilter, Stage,
};
use crate::protocol::{Element, Subscription};
use std::iter::Peekable;
use std::sync::Arc;

/// What an element-wise transform decided for one element
pub(crate) enum Step {
    Emit(Element),
    /// Consume the element without emitting anything
    Drop,
    /// Emit, then complete downstream and cancel upstream
    EmitLast(Element),
    /// Complete downstream and cancel upstream without emitting
    Complete,
    Fail(StreamError),
}

/// How a drop-while stage decides to keep dropping
pub(crate) enum DropRule {
    While(PredicateFn),
    /// Skip: drop a fixed number of elements without evaluating anything
    Countdown(u64),
}

/// Element-wise stages: every upstream element yields at most one element
pub(crate) enum Transform {
    Identity,
    Map(MapFn),
    Filter(PredicateFn),
    DropWhile { rule: DropRule, dropping: bool },
    TakeWhile(PredicateFn),
    Limit { remaining: u64 },
    Peek(PeekFn),
    Distinct(SeenFilter),
    OnComplete(HookFn),
    OnError(ErrorHookFn),
    OnTerminate(HookFn),
}

impl Transform {
    pub(crate) fn apply(&mut self, item: Element) -> Step {
        match self {
            Transform::Identity
            | Transform::OnComplete(_)
            | Transform::OnError(_)
            | Transform::OnTerminate(_) => Step::Emit(item),
            Transform::Map(f) => match f(item) {
                Ok(mapped) => Step::Emit(mapped),
                Err(error) => Step::Fail(error),
            },
            Transform::Filter(predicate) => match predicate(&item) {
                Ok(true) => Step::Emit(item),
                Ok(false) => Step::Drop,
                Err(error) => Step::Fail(error),
            },
            Transform::DropWhile { rule, dropping } => {
                if !*dropping {
                    return Step::Emit(item);
                }
                match rule {
                    DropRule::Countdown(remaining) => {
                        if *remaining == 0 {
                            *dropping = false;
                            return Step::Emit(item);
                        }
                        *remaining -= 1;
                        if *remaining == 0 {
                            *dropping = false;
                        }
                        Step::Drop
                    }
                    DropRule::While(predicate) => match predicate(&item) {
                        Ok(true) => Step::Drop,
                        Ok(false) => {
                            *dropping = false;
                            Step::Emit(item)
                        }
                        Err(error) => Step::Fail(error),
                    },
                }
            }
            Transform::TakeWhile(predicate) => match predicate(&item) {
                Ok(true) => Step::Emit(item),
                Ok(false) => Step::Complete,
                Err(error) => Step::Fail(error),
            },
            Transform::Limit { remaining } => match *remaining {
                0 => Step::Complete,
                1 => {
                    *remaining = 0;
                    Step::EmitLast(item)
                }
                _ => {
                    *remaining -= 1;
                    Step::Emit(item)
                }
            },
            Transform::Peek(f) => match f(&item) {
                Ok(()) => Step::Emit(item),
                Err(error) => Step::Fail(error),
            },
            Transform::Distinct(first_seen) => match first_seen(&item) {
                Ok(true) => Step::Emit(item),
                Ok(false) => Step::Drop,
                Err(error) => Step::Fail(error),
            },
        }
    }

    /// Runs completion hooks; a failing hook turns completion into failure
    pub(crate) fn on_complete(&self) -> Result<(), StreamError> {
        match self {
            Transform::OnComplete(hook) | Transform::OnTerminate(hook) => hook(),
            _ => Ok(()),
        }
    }

    pub(crate) fn on_error(&self, error: &StreamError) {
        match self {
            Transform::OnError(hook) => hook(error),
            Transform::OnTerminate(hook) => {
                // The stream is already failing; a hook error has nowhere to go
                let _ = hook();
            }
            _ => {}
        }
    }

    pub(crate) fn on_cancel(&self) {
        if let Transform::OnTerminate(hook) = self {
            let _ = hook();
        }
    }

    /// Limit(0) never needs upstream at all
    pub(crate) fn is_exhausted(&self) -> bool {
        matches!(self, Transform::Limit { remaining: 0 })
    }

    /// Cap on outstanding upstream demand, if the transform has one
    pub(crate) fn upstream_cap(&self) -> Option<u64> {
        match self {
            Transform::Limit { remaining } => Some(*remaining),
            _ => None,
        }
    }
}

/// Queue plus refill policy of a buffer stage
pub(crate) struct BufferState {
    pub(crate) queue: StageBuffer<Element>,
    pub(crate) refill: RefillController,
}

/// The nested publisher a flat-map stage is currently draining
pub(crate) struct InnerLink {
    pub(crate) generation: u64,
    pub(crate) subscription: Option<Arc<dyn Subscription>>,
    /// Demand requested from the inner publisher and not yet delivered
    pub(crate) outstanding: DemandTracker,
}

pub(crate) struct FlatMapState {
    pub(crate) f: FlatMapFn,
    pub(crate) inner: Option<InnerLink>,
    pub(crate) generation: u64,
}

pub(crate) struct FlatMapIterState {
    pub(crate) f: FlatMapIterFn,
    pub(crate) current: Option<Peekable<ElementIter>>,
}

/// Mutable per-run state of one intermediate stage
pub(crate) enum Operator {
    Transform(Transform),
    Buffer(BufferState),
    FlatMap(FlatMapState),
    FlatMapIter(FlatMapIterState),
}

impl Operator {
    /// Instantiate run state for an intermediate stage
    ///
    /// Returns `None` for sources, terminals and external processors, which
    /// are not executed by a processor stage.
    pub(crate) fn from_stage(stage: &Stage, config: &EngineConfig) -> Option<Operator> {
        let transform = match stage {
            Stage::Map(f) => Transform::Map(Arc::clone(f)),
            Stage::Filter(p) => Transform::Filter(Arc::clone(p)),
            Stage::Skip(n) => Transform::DropWhile {
                rule: DropRule::Countdown(*n),
                dropping: *n > 0,
            },
            Stage::DropWhile(p) => Transform::DropWhile {
                rule: DropRule::While(Arc::clone(p)),
                dropping: true,
            },
            Stage::TakeWhile(p) => Transform::TakeWhile(Arc::clone(p)),
            Stage::Limit(n) => Transform::Limit { remaining: *n },
            Stage::Peek(f) => Transform::Peek(Arc::clone(f)),
            Stage::Distinct(factory) => Transform::Distinct(factory()),
            Stage::OnComplete(hook) => Transform::OnComplete(Arc::clone(hook)),
            Stage::OnError(hook) => Transform::OnError(Arc::clone(hook)),
            Stage::OnTerminate(hook) => Transform::OnTerminate(Arc::clone(hook)),
            Stage::Buffer { capacity, policy } => {
                let capacity = capacity.unwrap_or(config.default_buffer_capacity);
                return Some(Operator::Buffer(BufferState {
                    queue: StageBuffer::new(capacity, *policy),
                    refill: config.refill,
                }));
            }
            Stage::FlatMap(f) => {
                return Some(Operator::FlatMap(FlatMapState {
                    f: Arc::clone(f),
                    inner: None,
                    generation: 0,
                }));
            }
            Stage::FlatMapIter(f) => {
                return Some(Operator::FlatMapIter(FlatMapIterState {
                    f: Arc::clone(f),
                    current: None,
                }));
            }
            Stage::Of(_)
            | Stage::Failed(_)
            | Stage::Publisher(_)
            | Stage::Processor(_)
            | Stage::Collect(_)
            | Stage::ForEach(_)
            | Stage::FindFirst(_)
            | Stage::Cancel
            | Stage::Subscriber(_) => return None,
        };
        Some(Operator::Transform(transform))
    }

    pub(crate) fn identity() -> Operator {
        Operator::Transform(Transform::Identity)
    }

    pub(crate) fn transform(&self) -> Option<&Transform> {
        match self {
            Operator::Transform(transform) => Some(transform),
            _ => None,
        }
    }

    /// Whether the buffer policy wants unbounded upstream demand
    pub(crate) fn drops_oldest(&self) -> bool {
        matches!(
            self,
            Operator::Buffer(state) if state.queue.policy() == OverflowPolicy::DropOldest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn el(n: i32) -> Element {
        Box::new(n)
    }

    fn value(step: Step) -> Option<i32> {
        match step {
            Step::Emit(e) | Step::EmitLast(e) => e.downcast::<i32>().ok().map(|b| *b),
            _ => None,
        }
    }

    fn below(limit: i32) -> PredicateFn {
        Arc::new(move |e: &Element| -> Result<bool> {
            Ok(*e.downcast_ref::<i32>().unwrap() < limit)
        })
    }

    #[test]
    fn test_skip_counts_down_then_passes() {
        let mut op = Transform::DropWhile {
            rule: DropRule::Countdown(2),
            dropping: true,
        };
        assert!(matches!(op.apply(el(1)), Step::Drop));
        assert!(matches!(op.apply(el(2)), Step::Drop));
        assert_eq!(value(op.apply(el(3))), Some(3));
        assert!(matches!(op, Transform::DropWhile { dropping: false, .. }));
    }

    #[test]
    fn test_drop_while_stops_evaluating_after_first_rejection() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let predicate: PredicateFn = Arc::new(move |e: &Element| -> Result<bool> {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(*e.downcast_ref::<i32>().unwrap() < 3)
        });
        let mut op = Transform::DropWhile {
            rule: DropRule::While(predicate),
            dropping: true,
        };
        let out: Vec<_> = [1, 2, 3, 1, 2]
            .into_iter()
            .filter_map(|n| value(op.apply(el(n))))
            .collect();
        assert_eq!(out, vec![3, 1, 2]);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn test_take_while_completes_on_first_failure() {
        let mut op = Transform::TakeWhile(below(3));
        assert_eq!(value(op.apply(el(1))), Some(1));
        assert!(matches!(op.apply(el(5)), Step::Complete));
    }

    #[test]
    fn test_limit_marks_last_element() {
        let mut op = Transform::Limit { remaining: 2 };
        assert!(matches!(op.apply(el(1)), Step::Emit(_)));
        assert!(matches!(op.apply(el(2)), Step::EmitLast(_)));
        assert!(op.is_exhausted());
        assert_eq!(op.upstream_cap(), Some(0));
    }

    #[test]
    fn test_map_failure_becomes_fail_step() {
        let mut op = Transform::Map(Arc::new(|_e: Element| -> Result<Element> {
            Err(StreamError::msg("failed"))
        }));
        match op.apply(el(1)) {
            Step::Fail(error) => assert_eq!(error.to_string(), "failed"),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn test_fresh_state_per_instantiation() {
        let config = EngineConfig::default();
        let stage = Stage::Skip(1);
        for _ in 0..2 {
            let Some(Operator::Transform(mut op)) = Operator::from_stage(&stage, &config) else {
                panic!("skip is a transform");
            };
            assert!(matches!(op.apply(el(1)), Step::Drop));
            assert_eq!(value(op.apply(el(2))), Some(2));
        }
    }

    #[test]
    fn test_sources_are_not_operators() {
        let config = EngineConfig::default();
        assert!(Operator::from_stage(&Stage::Cancel, &config).is_none());
        assert!(Operator::from_stage(&Stage::Failed(StreamError::EmptyStream), &config).is_none());
    }

    #[test]
    fn test_buffer_uses_default_capacity() {
        let config = EngineConfig::default().with_default_buffer_capacity(4);
        let stage = Stage::Buffer {
            capacity: None,
            policy: OverflowPolicy::DropOldest,
        };
        let op = Operator::from_stage(&stage, &config).unwrap();
        assert!(op.drops_oldest());
        match op {
            Operator::Buffer(state) => assert_eq!(state.queue.capacity(), 4),
            _ => panic!("expected buffer"),
        }
    }
}
