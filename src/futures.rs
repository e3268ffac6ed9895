//! Orchestrator-side futures.
//!
//! [`DurableFuture`] is the handle for one logical task: an activity, a
//! sub-orchestration or a timer, plus its retry attempts when a policy is
//! attached. It never blocks; polling only consults completions the replay
//! executor has made visible.
//!
//! [`WaitAll`] and [`WaitAny`] compose any futures. Because the executor
//! reveals completions one at a time in history order, the first branch of a
//! `WaitAny` to become ready is the one whose completion was recorded first,
//! on every replay.
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{FanInError, OrchestrationError};
use crate::history::TaskKind;
use crate::retry::RetryPolicy;
use crate::{OrchestrationContext, Resolution, codec};

/// A scheduled task as seen by orchestrator code.
///
/// Activities and sub-orchestrations resolve with their output or with
/// [`OrchestrationError::PermanentTaskFailure`]; timers resolve with `Ok` and
/// an empty payload.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: TaskKind,
    name: String,
    input: String,
    delay: Option<Duration>,
    policy: Option<RetryPolicy>,
    attempt: u32,
    task_id: u64,
    backoff_timer: Option<u64>,
}

impl DurableFuture {
    pub(crate) fn schedule(
        ctx: OrchestrationContext,
        kind: TaskKind,
        name: String,
        input: String,
        delay: Option<Duration>,
        policy: Option<RetryPolicy>,
    ) -> Self {
        // Policy fields are public, so a hand-edited policy is checked here.
        if let Some(Err(err)) = policy.as_ref().map(RetryPolicy::validate) {
            panic!("invalid retry policy for '{name}': {err}");
        }
        let task_id = ctx.schedule_task(kind, &name, &input, delay, 1);
        Self {
            ctx,
            kind,
            name,
            input,
            delay,
            policy,
            attempt: 1,
            task_id,
            backoff_timer: None,
        }
    }

    /// Id of the current attempt.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Cooperatively cancel a pending timer. Returns false for other kinds,
    /// for timers that already fired and for repeated calls.
    pub fn cancel(&self) -> bool {
        self.kind == TaskKind::Timer && self.ctx.cancel_task(self.task_id)
    }

    /// Decode the output as JSON into `Out`.
    pub fn into_typed<Out: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<Out, OrchestrationError>> {
        async move {
            let raw = self.await?;
            codec::decode::<Out>(&raw).map_err(|e| OrchestrationError::Application(format!("decode: {e}")))
        }
    }

    fn retry_or_fail(&mut self, failure: crate::FailureDetails) -> Option<OrchestrationError> {
        let retry = failure.retriable
            && self
                .policy
                .as_ref()
                .is_some_and(|p| p.should_retry(&failure, self.attempt));
        if !retry {
            return Some(OrchestrationError::PermanentTaskFailure {
                task_id: self.task_id,
                name: self.name.clone(),
                attempts: self.attempt,
                failure,
            });
        }
        let delay = self
            .policy
            .as_ref()
            .map_or(Duration::ZERO, |p| p.next_delay(self.attempt));
        if delay.is_zero() {
            self.next_attempt();
        } else {
            self.backoff_timer = Some(self.ctx.schedule_backoff(self.task_id, &self.name, delay));
        }
        None
    }

    fn next_attempt(&mut self) {
        self.attempt += 1;
        self.task_id = self
            .ctx
            .schedule_task(self.kind, &self.name, &self.input, self.delay, self.attempt);
    }
}

impl Future for DurableFuture {
    type Output = Result<String, OrchestrationError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(timer_id) = this.backoff_timer {
                if this.ctx.resolution(timer_id).is_none() {
                    return Poll::Pending;
                }
                this.backoff_timer = None;
                this.next_attempt();
                continue;
            }
            match this.ctx.resolution(this.task_id) {
                None => return Poll::Pending,
                Some(Resolution::Completed(result)) => return Poll::Ready(Ok(result)),
                Some(Resolution::Fired) => return Poll::Ready(Ok(String::new())),
                Some(Resolution::Failed(failure)) => {
                    if let Some(err) = this.retry_or_fail(failure) {
                        return Poll::Ready(Err(err));
                    }
                }
            }
        }
    }
}

enum Slot<F: Future> {
    Pending(Pin<Box<F>>),
    Done(F::Output),
    Taken,
}

/// Future returned by [`wait_all`].
pub struct WaitAll<F: Future> {
    slots: Vec<Slot<F>>,
}

// Branches are boxed and outputs are never pinned.
impl<F: Future> Unpin for WaitAll<F> {}

/// Resolve once every future resolved. Outputs keep submission order no
/// matter which completion arrived first.
pub fn wait_all<T, F>(futures: impl IntoIterator<Item = F>) -> WaitAll<F>
where
    F: Future<Output = Result<T, OrchestrationError>>,
{
    WaitAll {
        slots: futures.into_iter().map(|f| Slot::Pending(Box::pin(f))).collect(),
    }
}

impl<T, F> Future for WaitAll<F>
where
    F: Future<Output = Result<T, OrchestrationError>>,
{
    type Output = Result<Vec<T>, FanInError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut pending = false;
        for slot in this.slots.iter_mut() {
            if let Slot::Pending(fut) = slot {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(out) => *slot = Slot::Done(out),
                    Poll::Pending => pending = true,
                }
            }
        }
        if pending {
            return Poll::Pending;
        }
        let outcomes: Vec<Result<T, OrchestrationError>> = this
            .slots
            .iter_mut()
            .filter_map(|slot| match mem::replace(slot, Slot::Taken) {
                Slot::Done(out) => Some(out),
                _ => None,
            })
            .collect();
        if outcomes.iter().all(|o| o.is_ok()) {
            Poll::Ready(Ok(outcomes.into_iter().filter_map(Result::ok).collect()))
        } else {
            Poll::Ready(Err(FanInError { outcomes }))
        }
    }
}

/// Future returned by [`wait_any`].
pub struct WaitAny<F> {
    branches: Vec<Pin<Box<F>>>,
}

/// Resolve with `(index, output)` of the first future to resolve. Losing
/// branches are dropped; their tasks keep running and late completions are
/// ignored. Panics if `futures` is empty.
pub fn wait_any<F: Future>(futures: impl IntoIterator<Item = F>) -> WaitAny<F> {
    let branches: Vec<_> = futures.into_iter().map(Box::pin).collect();
    assert!(!branches.is_empty(), "wait_any requires at least one future");
    WaitAny { branches }
}

impl<F: Future> Future for WaitAny<F> {
    type Output = (usize, F::Output);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (index, fut) in this.branches.iter_mut().enumerate() {
            if let Poll::Ready(out) = fut.as_mut().poll(cx) {
                return Poll::Ready((index, out));
            }
        }
        Poll::Pending
    }
}
