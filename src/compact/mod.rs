//! Adaptive batching of small thunks ("compaction").
//!
//! A [`Compactor`] turns a producer of cheap steps into a lazy sequence
//! of [`Batch`]es, each worth the overhead of scheduling. Static mode
//! uses a fixed batch size; dynamic mode times each batch as it runs and
//! steers the size toward a target duration through a shared estimate.
//! Nothing is pulled from the producer and no timer starts until the
//! consumer asks for the next batch, and a batch's accumulator is built
//! only when its thunk is invoked.

mod estimate;

use crate::telemetry::{self, RuntimeEvent};
use estimate::SharedEstimate;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One accumulation step: takes the accumulator, returns it advanced.
pub type Step<A> = Box<dyn FnOnce(A) -> A + Send + 'static>;

/// Reduction order of the steps inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldDirection {
    /// `step_n(… step_1(identity))`: steps applied in production order.
    Left,
    /// `step_1(… step_n(identity))`: steps applied in reverse.
    Right,
}

/// Priming: run the first batches sequentially under a relaxed estimate
/// rule until the suggested size settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimeConfig {
    /// Stop priming after this many batches even without stabilization.
    pub limit: Option<usize>,
    /// On stabilization, pin the stabilized size for the rest of the run.
    pub freeze: bool,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Static {
        size: usize,
    },
    Dynamic {
        target: Duration,
        estimate_hint: Option<usize>,
        prime: Option<PrimeConfig>,
        scale_up: usize,
        scale_down: usize,
    },
}

/// Batching policy. Immutable-by-replacement: every setter returns an
/// updated value, so policies can be shared and specialized freely.
#[derive(Debug, Clone, Copy)]
pub struct Compactor {
    mode: Mode,
    fold: FoldDirection,
}

impl Compactor {
    /// Fixed batches of `size` (the tail batch may be shorter).
    pub fn new_static(size: usize) -> Self {
        Self {
            mode: Mode::Static { size: size.max(1) },
            fold: FoldDirection::Left,
        }
    }

    /// Adaptive batches steered toward `target` per batch.
    pub fn new_dynamic(target: Duration) -> Self {
        Self {
            mode: Mode::Dynamic {
                target,
                estimate_hint: None,
                prime: None,
                scale_up: 2,
                scale_down: 2,
            },
            fold: FoldDirection::Left,
        }
    }

    /// Switch to static mode with the given size.
    pub fn set_size(mut self, size: usize) -> Self {
        self.mode = Mode::Static { size: size.max(1) };
        self
    }

    /// Switch to (or retune) dynamic mode with the given target.
    pub fn set_time(mut self, target: Duration) -> Self {
        self.mode = match self.mode {
            Mode::Dynamic {
                estimate_hint,
                prime,
                scale_up,
                scale_down,
                ..
            } => Mode::Dynamic {
                target,
                estimate_hint,
                prime,
                scale_up,
                scale_down,
            },
            Mode::Static { .. } => Mode::Dynamic {
                target,
                estimate_hint: None,
                prime: None,
                scale_up: 2,
                scale_down: 2,
            },
        };
        self
    }

    /// Hint the expected thunk count per target interval; the first
    /// dynamic batch then has exactly this size. No effect in static
    /// mode.
    pub fn set_estimated_number(mut self, n: usize) -> Self {
        if let Mode::Dynamic { estimate_hint, .. } = &mut self.mode {
            *estimate_hint = Some(n.max(1));
        }
        self
    }

    pub fn set_fold_direction(mut self, fold: FoldDirection) -> Self {
        self.fold = fold;
        self
    }

    /// Enable priming. No effect in static mode.
    pub fn prime(mut self, limit: Option<usize>, freeze: bool) -> Self {
        if let Mode::Dynamic { prime, .. } = &mut self.mode {
            *prime = Some(PrimeConfig { limit, freeze });
        }
        self
    }

    pub fn do_not_prime(mut self) -> Self {
        if let Mode::Dynamic { prime, .. } = &mut self.mode {
            *prime = None;
        }
        self
    }

    /// Geometric growth/shrink factors for dynamic sizing.
    pub fn set_scaling(mut self, up: usize, down: usize) -> Self {
        if let Mode::Dynamic {
            scale_up,
            scale_down,
            ..
        } = &mut self.mode
        {
            *scale_up = up.max(1);
            *scale_down = down.max(1);
        }
        self
    }

    /// Base form: batch the steps of an unfold-style producer. The
    /// producer is pulled only as batches are pulled; each batch thunk
    /// folds its steps over a fresh `identity()`.
    pub fn compact<S, A, P, I>(&self, producer: P, seed: S, identity: I) -> Batches<S, A, P, I>
    where
        A: Send + 'static,
        P: FnMut(S) -> Option<(Step<A>, S)>,
        I: Fn() -> A + Send + Sync + 'static,
    {
        let run = match self.mode {
            Mode::Static { size } => RunState::Fixed { size },
            Mode::Dynamic {
                target,
                estimate_hint,
                prime,
                scale_up,
                scale_down,
            } => {
                let target_us = (target.as_micros() as u64).max(1);
                let estimate = Arc::new(SharedEstimate::new());
                if let Some(hint) = estimate_hint {
                    estimate.seed(target_us, hint as u64);
                }
                RunState::Adaptive {
                    target_us,
                    scale_up: scale_up as u64,
                    scale_down: scale_down as u64,
                    estimate,
                    priming: prime.map(|p| Priming {
                        remaining: p.limit,
                        freeze: p.freeze,
                        last_size: None,
                    }),
                }
            }
        };
        Batches {
            producer,
            state: Some(seed),
            identity: Arc::new(identity),
            fold: self.fold,
            run,
            _marker: PhantomData,
        }
    }

    /// Batch an iterator of steps.
    pub fn compact_iter<A, T, I>(&self, steps: T, identity: I) -> impl Iterator<Item = Batch<A>>
    where
        A: Send + 'static,
        T: Iterator<Item = Step<A>>,
        I: Fn() -> A + Send + Sync + 'static,
    {
        self.compact(|mut it: T| it.next().map(|step| (step, it)), steps, identity)
    }

    /// Batch a list of steps.
    pub fn compact_list<A, I>(&self, steps: Vec<Step<A>>, identity: I) -> impl Iterator<Item = Batch<A>>
    where
        A: Send + 'static,
        I: Fn() -> A + Send + Sync + 'static,
    {
        self.compact_iter(steps.into_iter(), identity)
    }

    /// Map `f` over the items; each batch yields the mapped values of
    /// its slice, in order.
    pub fn map_iter<X, Y, F, T>(&self, f: F, items: T) -> impl Iterator<Item = Batch<Vec<Y>>>
    where
        X: Send + 'static,
        Y: Send + 'static,
        F: Fn(X) -> Y + Send + Sync + 'static,
        T: Iterator<Item = X>,
    {
        let f = Arc::new(f);
        let steps = items.map(move |x| -> Step<Vec<Y>> {
            let f = f.clone();
            Box::new(move |mut acc: Vec<Y>| {
                acc.push(f(x));
                acc
            })
        });
        self.compact_iter(steps, Vec::new)
    }

    /// Map `f` over a list.
    pub fn map_list<X, Y, F>(&self, f: F, items: Vec<X>) -> impl Iterator<Item = Batch<Vec<Y>>>
    where
        X: Send + 'static,
        Y: Send + 'static,
        F: Fn(X) -> Y + Send + Sync + 'static,
    {
        self.map_iter(f, items.into_iter())
    }

    /// Flat-map `f` over the items; each batch yields the concatenated
    /// expansions of its slice, in order.
    pub fn flat_map_iter<X, Y, V, F, T>(&self, f: F, items: T) -> impl Iterator<Item = Batch<Vec<Y>>>
    where
        X: Send + 'static,
        Y: Send + 'static,
        V: IntoIterator<Item = Y>,
        F: Fn(X) -> V + Send + Sync + 'static,
        T: Iterator<Item = X>,
    {
        let f = Arc::new(f);
        let steps = items.map(move |x| -> Step<Vec<Y>> {
            let f = f.clone();
            Box::new(move |mut acc: Vec<Y>| {
                acc.extend(f(x));
                acc
            })
        });
        self.compact_iter(steps, Vec::new)
    }

    /// Flat-map `f` over a list.
    pub fn flat_map_list<X, Y, V, F>(&self, f: F, items: Vec<X>) -> impl Iterator<Item = Batch<Vec<Y>>>
    where
        X: Send + 'static,
        Y: Send + 'static,
        V: IntoIterator<Item = Y>,
        F: Fn(X) -> V + Send + Sync + 'static,
    {
        self.flat_map_iter(f, items.into_iter())
    }
}

/// A group of steps worth scheduling as one unit. Running the thunk
/// builds the accumulator; in dynamic mode it also times itself and
/// offers the measurement to the shared estimate.
pub struct Batch<A> {
    size: usize,
    thunk: Box<dyn FnOnce() -> A + Send + 'static>,
}

impl<A> Batch<A> {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn run(self) -> A {
        (self.thunk)()
    }
}

impl<A> std::fmt::Debug for Batch<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch").field("size", &self.size).finish()
    }
}

struct Priming {
    remaining: Option<usize>,
    freeze: bool,
    last_size: Option<usize>,
}

enum RunState {
    Fixed {
        size: usize,
    },
    Adaptive {
        target_us: u64,
        scale_up: u64,
        scale_down: u64,
        estimate: Arc<SharedEstimate>,
        priming: Option<Priming>,
    },
}

/// Lazy batch sequence; see [`Compactor::compact`].
pub struct Batches<S, A, P, I> {
    producer: P,
    state: Option<S>,
    identity: Arc<I>,
    fold: FoldDirection,
    run: RunState,
    _marker: PhantomData<fn() -> A>,
}

impl<S, A, P, I> std::fmt::Debug for Batches<S, A, P, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batches")
            .field("fold", &self.fold)
            .field("exhausted", &self.state.is_none())
            .finish()
    }
}

fn fold_steps<A>(steps: Vec<Step<A>>, identity: A, fold: FoldDirection) -> A {
    match fold {
        FoldDirection::Left => steps.into_iter().fold(identity, |acc, step| step(acc)),
        FoldDirection::Right => steps.into_iter().rev().fold(identity, |acc, step| step(acc)),
    }
}

fn elapsed_micros(start: Instant) -> u64 {
    (start.elapsed().as_micros() as u64).max(1)
}

impl<S, A, P, I> Iterator for Batches<S, A, P, I>
where
    A: Send + 'static,
    P: FnMut(S) -> Option<(Step<A>, S)>,
    I: Fn() -> A + Send + Sync + 'static,
{
    type Item = Batch<A>;

    fn next(&mut self) -> Option<Batch<A>> {
        let size_goal = match &self.run {
            RunState::Fixed { size } => *size,
            RunState::Adaptive {
                target_us,
                scale_up,
                scale_down,
                estimate,
                ..
            } => estimate
                .suggested(*target_us, *scale_up, *scale_down)
                .unwrap_or(1),
        };

        // Priming bookkeeping happens at pull time: the size repeating
        // declares stability, the limit running out ends priming after
        // one more sequential batch.
        let mut inline = false;
        let mut stabilized = false;
        let mut freeze_to: Option<usize> = None;
        let mut last_primed = false;
        if let RunState::Adaptive {
            priming: Some(priming),
            ..
        } = &mut self.run
        {
            if priming.last_size == Some(size_goal) {
                stabilized = true;
                if priming.freeze {
                    freeze_to = Some(size_goal);
                }
            } else {
                priming.last_size = Some(size_goal);
                inline = true;
                if let Some(remaining) = priming.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        last_primed = true;
                    }
                }
            }
        }
        if stabilized {
            telemetry::emit(RuntimeEvent::BatcherStabilized { size: size_goal });
            if let RunState::Adaptive { priming, .. } = &mut self.run {
                *priming = None;
            }
            if let Some(size) = freeze_to {
                self.run = RunState::Fixed { size };
            }
        }

        let mut steps: Vec<Step<A>> = Vec::with_capacity(size_goal);
        let mut state = Some(self.state.take()?);
        while steps.len() < size_goal {
            match (self.producer)(state.take().expect("state present while producing")) {
                Some((step, next)) => {
                    steps.push(step);
                    state = Some(next);
                }
                None => break,
            }
        }
        self.state = state;
        if steps.is_empty() {
            return None;
        }
        let size = steps.len();
        let identity = self.identity.clone();
        let fold = self.fold;

        let batch = match &self.run {
            RunState::Fixed { .. } => Batch {
                size,
                thunk: Box::new(move || fold_steps(steps, (*identity)(), fold)),
            },
            RunState::Adaptive {
                target_us,
                estimate,
                ..
            } => {
                let stamp = estimate.next_stamp();
                let target_us = *target_us;
                if inline {
                    // Priming: run now, on the consumer's thread.
                    let start = Instant::now();
                    let output = fold_steps(steps, (*identity)(), fold);
                    let elapsed = elapsed_micros(start);
                    estimate.update(target_us, elapsed, size as u64, stamp, true);
                    #[cfg(feature = "telemetry")]
                    telemetry::metrics::batch_metrics().record(elapsed);
                    Batch {
                        size,
                        thunk: Box::new(move || output),
                    }
                } else {
                    let estimate = estimate.clone();
                    Batch {
                        size,
                        thunk: Box::new(move || {
                            let start = Instant::now();
                            let output = fold_steps(steps, (*identity)(), fold);
                            let elapsed = elapsed_micros(start);
                            estimate.update(target_us, elapsed, size as u64, stamp, false);
                            #[cfg(feature = "telemetry")]
                            telemetry::metrics::batch_metrics().record(elapsed);
                            output
                        }),
                    }
                }
            }
        };

        if last_primed {
            if let RunState::Adaptive { priming, .. } = &mut self.run {
                *priming = None;
            }
        }
        Some(batch)
    }
}
