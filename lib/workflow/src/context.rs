//! Deterministic replay context.
//!
//! A [`Context`] is built from the persisted run and handed to the workflow
//! body. Each durable primitive first looks for its earlier decision in the
//! old log: a recorded decision is copied into the new log and reproduced,
//! and only new decisions run real code. When a primitive cannot make
//! progress it records why and returns [`WorkflowError::Interrupted`].
//!
//! Save and sleep draw ids from one sequence; logs have their own. The body
//! must therefore call them in the same order on every replay.

use crate::child::{
    ChildWorkflowHandle, Host, NoHost, START_CHILD_WORKFLOW, StartChildRequest, StartChildResponse,
};
use crate::error::{JournalError, WorkflowError};
use crate::interrupt::Interrupt;
use crate::operation::{LogLevel, OperationEvent, Run, SavedValue};
use crate::retry::{BackoffPolicy, RetryConfig, StrategyBackoff};
use chrono::{DateTime, Utc};
use driftwood_core::{Clock, RunId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Options for one saved step.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Fail the attempt if the step runs longer than this.
    pub timeout: Option<Duration>,
    /// Retry failed attempts under this policy.
    pub retry: Option<RetryConfig>,
}

impl SaveOptions {
    /// Retries up to `max_retries` attempts.
    #[must_use]
    pub fn retries(max_retries: u32) -> Self {
        Self {
            retry: Some(RetryConfig::new(max_retries)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Builds a [`Context`].
pub struct ContextBuilder {
    run: Run,
    clock: Arc<dyn Clock>,
    host: Arc<dyn Host>,
    backoff: Arc<dyn BackoffPolicy>,
}

impl ContextBuilder {
    /// Routes hostcalls to `host`.
    #[must_use]
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    /// Computes retry delays with `backoff`.
    #[must_use]
    pub fn backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Builds the context.
    ///
    /// # Errors
    ///
    /// Returns an error if the run does not begin with a Start.
    pub fn build(self) -> Result<Context, JournalError> {
        let kwargs = self.run.start_kwargs()?.clone();
        let new_run = self.run.replay_seed();
        Ok(Context {
            inner: Arc::new(Inner {
                run_id: self.run.run_id.clone(),
                kwargs,
                old: self.run,
                clock: self.clock,
                host: self.host,
                backoff: self.backoff,
                state: Mutex::new(ReplayState {
                    new_run,
                    next_id: 0,
                    next_log_id: 0,
                    consumed_sends: HashSet::new(),
                    raised: None,
                }),
            }),
        })
    }
}

struct Inner {
    run_id: RunId,
    kwargs: JsonValue,
    old: Run,
    clock: Arc<dyn Clock>,
    host: Arc<dyn Host>,
    backoff: Arc<dyn BackoffPolicy>,
    state: Mutex<ReplayState>,
}

struct ReplayState {
    new_run: Run,
    next_id: u32,
    next_log_id: u32,
    /// Indices into the old log of Send operations already delivered.
    consumed_sends: HashSet<usize>,
    raised: Option<Interrupt>,
}

/// Handle a workflow body uses for every durable operation.
///
/// Clones share the same replay state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("run_id", &self.inner.run_id)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Starts building a context for `run`.
    #[must_use]
    pub fn builder(run: Run, clock: Arc<dyn Clock>) -> ContextBuilder {
        ContextBuilder {
            run,
            clock,
            host: Arc::new(NoHost),
            backoff: Arc::new(StrategyBackoff),
        }
    }

    /// The run being replayed.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    /// Arguments the run was started with.
    #[must_use]
    pub fn kwargs(&self) -> &JsonValue {
        &self.inner.kwargs
    }

    /// Decodes the start arguments.
    ///
    /// # Errors
    ///
    /// Fails if the arguments do not decode as `T`.
    pub fn kwargs_as<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        Ok(serde_json::from_value(self.inner.kwargs.clone())?)
    }

    /// Current time according to the context's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// The first interrupt raised during this replay, if any.
    ///
    /// A body that swallows an interrupt still suspends.
    #[must_use]
    pub fn raised_interrupt(&self) -> Option<Interrupt> {
        self.state().raised
    }

    /// Returns the rebuilt log.
    ///
    /// Events delivered to the run but not yet consumed are carried over at
    /// the end so they survive to the next replay.
    #[must_use]
    pub fn finish(&self) -> Run {
        let state = self.state();
        let mut run = state.new_run.clone();
        if matches!(self.inner.old.is_stopped(), Ok(true)) {
            return run;
        }
        for (index, op) in self.inner.old.operations.iter().enumerate() {
            if matches!(op.event, OperationEvent::Send { .. })
                && !state.consumed_sends.contains(&index)
            {
                run.operations.push(op.clone());
            }
        }
        run
    }

    fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u32 {
        let mut state = self.state();
        state.next_id += 1;
        state.next_id
    }

    fn append(&self, at: DateTime<Utc>, event: OperationEvent) {
        self.state().new_run.push(at, event);
    }

    fn raise(&self, interrupt: Interrupt) -> WorkflowError {
        let mut state = self.state();
        if state.raised.is_none() {
            state.raised = Some(interrupt);
        }
        WorkflowError::Interrupted(interrupt)
    }

    fn recorded_save(&self, id: u32) -> Option<(DateTime<Utc>, SavedValue)> {
        self.inner
            .old
            .operations
            .iter()
            .rev()
            .find_map(|op| match &op.event {
                OperationEvent::Save { id: saved, value } if *saved == id => {
                    Some((op.at, value.clone()))
                }
                _ => None,
            })
    }

    /// Runs `f` at most once per decision and replays its recorded result.
    ///
    /// # Errors
    ///
    /// Returns the recorded or new failure of `f`, or
    /// [`Interrupt::SaveRetry`] while a retry is pending.
    pub async fn save<T, E, F, Fut>(&self, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.save_with(SaveOptions::default(), f).await
    }

    /// [`Context::save`] with a timeout and retry policy.
    ///
    /// Each failed attempt is recorded as `Retry` until the attempt count
    /// reaches `max_retries`, at which point it is recorded as `Failed` and
    /// never attempted again.
    ///
    /// # Errors
    ///
    /// See [`Context::save`].
    pub async fn save_with<T, E, F, Fut>(
        &self,
        options: SaveOptions,
        f: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let id = self.next_id();
        let now = self.now();
        let mut retries = 0;

        match self.recorded_save(id) {
            Some((at, SavedValue::Resolved { payload })) => {
                let value = serde_json::from_value(payload.clone())?;
                self.append(
                    at,
                    OperationEvent::Save {
                        id,
                        value: SavedValue::Resolved { payload },
                    },
                );
                return Ok(value);
            }
            Some((
                at,
                SavedValue::Retry {
                    wait_until,
                    counter,
                },
            )) => {
                if now < wait_until {
                    self.append(
                        at,
                        OperationEvent::Save {
                            id,
                            value: SavedValue::Retry {
                                wait_until,
                                counter,
                            },
                        },
                    );
                    return Err(self.raise(Interrupt::SaveRetry));
                }
                retries = counter;
            }
            Some((at, SavedValue::Failed { message, retries })) => {
                self.append(
                    at,
                    OperationEvent::Save {
                        id,
                        value: SavedValue::Failed {
                            message: message.clone(),
                            retries,
                        },
                    },
                );
                return Err(WorkflowError::failed(message));
            }
            None => {}
        }

        let attempt = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("save #{id} timed out after {limit:?}")),
            },
            None => f().await.map_err(|e| e.to_string()),
        };
        let now = self.now();

        let message = match attempt.and_then(|value| {
            serde_json::to_value(&value)
                .map(|payload| (value, payload))
                .map_err(|e| e.to_string())
        }) {
            Ok((value, payload)) => {
                self.append(
                    now,
                    OperationEvent::Save {
                        id,
                        value: SavedValue::Resolved { payload },
                    },
                );
                return Ok(value);
            }
            Err(message) => message,
        };

        let attempts = retries + 1;
        if let Some(retry) = options.retry.as_ref()
            && attempts < retry.max_retries
        {
            let delay = self
                .inner
                .backoff
                .delay(retry, retry.max_retries - attempts)
                .map_err(|e| WorkflowError::failed(e.to_string()))?;
            debug!(run_id = %self.inner.run_id, save_id = id, attempts, error = %message, "save failed, retrying");
            self.append(
                now,
                OperationEvent::Save {
                    id,
                    value: SavedValue::Retry {
                        wait_until: now + delay,
                        counter: attempts,
                    },
                },
            );
            return Err(self.raise(Interrupt::SaveRetry));
        }

        self.append(
            now,
            OperationEvent::Save {
                id,
                value: SavedValue::Failed {
                    message: message.clone(),
                    retries: attempts,
                },
            },
        );
        Err(WorkflowError::failed(message))
    }

    /// Suspends the run until `duration` after the first call.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt::Sleep`] while the deadline is in the future.
    pub fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        let id = self.next_id();
        let now = self.now();
        let recorded = self.inner.old.operations.iter().find_map(|op| match op.event {
            OperationEvent::Sleep {
                id: slept,
                start,
                end,
            } if slept == id => Some((op.at, start, end)),
            _ => None,
        });

        match recorded {
            Some((at, start, end)) => {
                self.append(at, OperationEvent::Sleep { id, start, end });
                if now < end {
                    Err(self.raise(Interrupt::Sleep))
                } else {
                    Ok(())
                }
            }
            None => {
                let span = chrono::Duration::from_std(duration)
                    .map_err(|e| WorkflowError::failed(format!("invalid sleep duration: {e}")))?;
                self.append(
                    now,
                    OperationEvent::Sleep {
                        id,
                        start: now,
                        end: now + span,
                    },
                );
                Err(self.raise(Interrupt::Sleep))
            }
        }
    }

    /// Takes the earliest undelivered event named `event_name`.
    fn take_event(&self, event_name: &str) -> Option<JsonValue> {
        let mut state = self.state();
        let found = self
            .inner
            .old
            .operations
            .iter()
            .enumerate()
            .find(|(index, op)| {
                matches!(&op.event, OperationEvent::Send { event_name: name, .. } if name == event_name)
                    && !state.consumed_sends.contains(index)
            });
        let (index, op) = found?;
        state.consumed_sends.insert(index);
        state.new_run.operations.push(op.clone());
        match &op.event {
            OperationEvent::Send { value, .. } => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns the next event named `event_name` delivered to this run.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt::WaitReceiveEvent`] if none is pending.
    pub fn receive<T: DeserializeOwned>(&self, event_name: &str) -> Result<T, WorkflowError> {
        match self.take_event(event_name) {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(self.raise(Interrupt::WaitReceiveEvent)),
        }
    }

    /// Passes the next event named `event_name` through a saved step.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt::WaitHandleEvent`] if none is pending, or the
    /// result of the saved step.
    pub async fn handle<T, E, F, Fut>(&self, event_name: &str, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce(JsonValue) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.take_event(event_name) {
            Some(value) => self.save(|| f(value)).await,
            None => Err(self.raise(Interrupt::WaitHandleEvent)),
        }
    }

    /// Suspends until `condition` holds. Evaluated on every replay.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt::WaitEnsureValue`] while the condition is false.
    pub async fn ensure<F, Fut>(&self, condition: F) -> Result<(), WorkflowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        if condition().await {
            Ok(())
        } else {
            Err(self.raise(Interrupt::WaitEnsureValue))
        }
    }

    /// Records a log line once and mirrors it to tracing the first time.
    pub fn log<A: Serialize + Debug>(&self, level: LogLevel, args: A) {
        let mut state = self.state();
        state.next_log_id += 1;
        let id = state.next_log_id;

        let recorded = self.inner.old.operations.iter().find(|op| {
            matches!(op.event, OperationEvent::Log { id: logged, level: was, .. } if logged == id && was == level)
        });
        if let Some(op) = recorded {
            state.new_run.operations.push(op.clone());
            return;
        }

        let payload =
            serde_json::to_value(&args).unwrap_or_else(|_| JsonValue::String(format!("{args:?}")));
        let run_id = &self.inner.run_id;
        match level {
            LogLevel::Debug => debug!(%run_id, log_id = id, %payload, "workflow log"),
            LogLevel::Info => info!(%run_id, log_id = id, %payload, "workflow log"),
            LogLevel::Warn => warn!(%run_id, log_id = id, %payload, "workflow log"),
            LogLevel::Error => error!(%run_id, log_id = id, %payload, "workflow log"),
        }
        let now = self.inner.clock.now();
        state.new_run.push(
            now,
            OperationEvent::Log {
                id,
                level,
                payload,
            },
        );
    }

    pub fn debug<A: Serialize + Debug>(&self, args: A) {
        self.log(LogLevel::Debug, args);
    }

    pub fn info<A: Serialize + Debug>(&self, args: A) {
        self.log(LogLevel::Info, args);
    }

    pub fn warn<A: Serialize + Debug>(&self, args: A) {
        self.log(LogLevel::Warn, args);
    }

    pub fn error<A: Serialize + Debug>(&self, args: A) {
        self.log(LogLevel::Error, args);
    }

    /// Calls the host directly.
    ///
    /// Hostcalls are not journaled; wrap any with side effects in `save`.
    ///
    /// # Errors
    ///
    /// Returns the host's error as a workflow failure.
    pub async fn hostcall(
        &self,
        op_name: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, WorkflowError> {
        Ok(self.inner.host.hostcall(op_name, payload).await?)
    }

    /// Starts a child run of workflow `name`.
    ///
    /// Call this inside `save` so replays reuse the recorded run id.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the start.
    pub async fn start_child_workflow<K: Serialize>(
        &self,
        name: &str,
        kwargs: K,
    ) -> Result<RunId, WorkflowError> {
        let request = StartChildRequest {
            name: name.to_string(),
            kwargs: serde_json::to_value(kwargs)?,
            parent: self.inner.run_id.clone(),
        };
        let response = self
            .hostcall(START_CHILD_WORKFLOW, serde_json::to_value(request)?)
            .await?;
        let StartChildResponse { run_id } = serde_json::from_value(response)?;
        Ok(run_id)
    }

    /// Creates an unstarted handle to a child run of workflow `name`.
    #[must_use]
    pub fn create_workflow_handle(&self, name: &str, kwargs: JsonValue) -> ChildWorkflowHandle {
        ChildWorkflowHandle {
            name: name.to_string(),
            kwargs,
            run_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::StopResult;
    use driftwood_core::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fresh_run(kwargs: JsonValue) -> Run {
        let mut run = Run::new(RunId::generate("replay").unwrap());
        run.push(Utc::now(), OperationEvent::Start { kwargs });
        run
    }

    fn context(run: Run, clock: &ManualClock) -> Context {
        Context::builder(run, Arc::new(clock.clone())).build().unwrap()
    }

    #[tokio::test]
    async fn save_runs_once_and_replays_payload() {
        let clock = ManualClock::default();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let step = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(json!({"total": 5}))
        };

        let ctx = context(fresh_run(json!({})), &clock);
        let first: JsonValue = ctx.save(step).await.unwrap();
        let log = ctx.finish();

        let ctx = context(log.clone(), &clock);
        let second: JsonValue = ctx.save(step).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.finish(), log);
    }

    #[tokio::test]
    async fn same_log_and_body_append_identical_operations() {
        let clock = ManualClock::default();
        let body = |ctx: Context| async move {
            let total: JsonValue = ctx
                .save(|| async { Ok::<_, String>(json!({"total": 5})) })
                .await?;
            ctx.info(total);
            ctx.sleep(Duration::from_secs(60))?;
            Ok::<_, WorkflowError>(())
        };
        let log = fresh_run(json!({}));

        let first = context(log.clone(), &clock);
        let first_result = body(first.clone()).await;
        let second = context(log, &clock);
        let second_result = body(second.clone()).await;

        assert_eq!(first_result, Err(WorkflowError::Interrupted(Interrupt::Sleep)));
        assert_eq!(first_result, second_result);
        let replayed = first.finish();
        assert_eq!(replayed.count("Sleep"), 1);
        assert_eq!(replayed, second.finish());
    }

    #[tokio::test]
    async fn retry_bound_records_retry_retry_failed() {
        let clock = ManualClock::default();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let options = SaveOptions::default()
            .with_retry(RetryConfig::new(3).with_backoff(1_000, 1_000));
        let mut run = fresh_run(json!({}));
        let mut recorded = Vec::new();

        for _ in 0..5 {
            let ctx = context(run.clone(), &clock);
            let result: Result<u32, WorkflowError> = ctx
                .save_with(options.clone(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>("always broken")
                })
                .await;
            run = ctx.finish();
            let saved = run
                .operations
                .iter()
                .find_map(|op| match &op.event {
                    OperationEvent::Save { value, .. } => Some(value.clone()),
                    _ => None,
                })
                .unwrap();
            recorded.push(saved.clone());

            if let SavedValue::Failed { message, retries } = saved {
                assert_eq!(message, "always broken");
                assert_eq!(retries, 3);
                assert_eq!(result, Err(WorkflowError::failed("always broken")));
                break;
            }
            assert_eq!(result, Err(WorkflowError::Interrupted(Interrupt::SaveRetry)));
            clock.advance(chrono::Duration::seconds(2));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(recorded[0], SavedValue::Retry { counter: 1, .. }));
        assert!(matches!(recorded[1], SavedValue::Retry { counter: 2, .. }));
        assert!(matches!(recorded[2], SavedValue::Failed { .. }));

        // A recorded failure is final.
        let ctx = context(run, &clock);
        let again: Result<u32, WorkflowError> = ctx
            .save_with(options, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, String>(1)
            })
            .await;
        assert!(again.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pending_retry_does_not_rerun() {
        let clock = ManualClock::default();
        let options = SaveOptions::retries(5);
        let ctx = context(fresh_run(json!({})), &clock);
        let _ = ctx
            .save_with(options.clone(), || async { Err::<u32, _>("nope") })
            .await;
        let run = ctx.finish();

        let ctx = context(run, &clock);
        let result = ctx
            .save_with(options, || async { Ok::<u32, String>(1) })
            .await;
        assert_eq!(result, Err(WorkflowError::Interrupted(Interrupt::SaveRetry)));
        assert_eq!(ctx.raised_interrupt(), Some(Interrupt::SaveRetry));
    }

    #[tokio::test(start_paused = true)]
    async fn save_timeout_fails_attempt() {
        let clock = ManualClock::default();
        let ctx = context(fresh_run(json!({})), &clock);
        let result = ctx
            .save_with(
                SaveOptions::default().with_timeout(Duration::from_millis(50)),
                || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<u32, String>(1)
                },
            )
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn sleep_is_recorded_once() {
        let clock = ManualClock::default();
        let ctx = context(fresh_run(json!({})), &clock);
        assert_eq!(
            ctx.sleep(Duration::from_secs(60)),
            Err(WorkflowError::Interrupted(Interrupt::Sleep))
        );
        let run = ctx.finish();
        assert_eq!(run.count("Sleep"), 1);

        clock.advance(chrono::Duration::seconds(30));
        let ctx = context(run, &clock);
        assert!(ctx.sleep(Duration::from_secs(60)).is_err());
        let run = ctx.finish();
        assert_eq!(run.count("Sleep"), 1);

        clock.advance(chrono::Duration::seconds(31));
        let ctx = context(run, &clock);
        assert!(ctx.sleep(Duration::from_secs(60)).is_ok());
        assert_eq!(ctx.finish().count("Sleep"), 1);
        assert_eq!(ctx.raised_interrupt(), None);
    }

    #[test]
    fn receive_consumes_each_send_once() {
        let clock = ManualClock::default();
        let mut run = fresh_run(json!({}));
        for n in [1, 2] {
            run.push(
                clock.now(),
                OperationEvent::Send {
                    event_name: "tick".to_string(),
                    value: json!(n),
                },
            );
        }

        let ctx = context(run, &clock);
        assert_eq!(ctx.receive::<i64>("tick").unwrap(), 1);
        assert_eq!(ctx.receive::<i64>("tick").unwrap(), 2);
        assert_eq!(
            ctx.receive::<i64>("tick"),
            Err(WorkflowError::Interrupted(Interrupt::WaitReceiveEvent))
        );
        assert_eq!(ctx.finish().count("Send"), 2);
    }

    #[test]
    fn unconsumed_sends_survive_replay() {
        let clock = ManualClock::default();
        let mut run = fresh_run(json!({}));
        run.push(
            clock.now(),
            OperationEvent::Send {
                event_name: "later".to_string(),
                value: json!("x"),
            },
        );
        let ctx = context(run, &clock);
        assert!(ctx.receive::<String>("other").is_err());
        let next = ctx.finish();
        assert_eq!(next.count("Send"), 1);

        let ctx = context(next, &clock);
        assert_eq!(ctx.receive::<String>("later").unwrap(), "x");
    }

    #[tokio::test]
    async fn handle_saves_the_handler_result() {
        let clock = ManualClock::default();
        let ctx = context(fresh_run(json!({})), &clock);
        let missing: Result<i64, WorkflowError> = ctx
            .handle("approve", |v| async move { Ok::<_, String>(v.as_i64().unwrap_or(0)) })
            .await;
        assert_eq!(
            missing,
            Err(WorkflowError::Interrupted(Interrupt::WaitHandleEvent))
        );

        let mut run = fresh_run(json!({}));
        run.push(
            clock.now(),
            OperationEvent::Send {
                event_name: "approve".to_string(),
                value: json!(9),
            },
        );
        let ctx = context(run, &clock);
        let handled: i64 = ctx
            .handle("approve", |v| async move { Ok::<_, String>(v.as_i64().unwrap_or(0) * 2) })
            .await
            .unwrap();
        assert_eq!(handled, 18);
        assert_eq!(ctx.finish().count("Save"), 1);
    }

    #[tokio::test]
    async fn ensure_interrupts_until_true() {
        let clock = ManualClock::default();
        let ctx = context(fresh_run(json!({})), &clock);
        assert_eq!(
            ctx.ensure(|| async { false }).await,
            Err(WorkflowError::Interrupted(Interrupt::WaitEnsureValue))
        );
        assert!(ctx.ensure(|| async { true }).await.is_ok());
    }

    #[derive(Debug)]
    struct NotJson;

    impl Serialize for NotJson {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not representable"))
        }
    }

    #[test]
    fn log_is_idempotent_and_stringifies() {
        let clock = ManualClock::default();
        let ctx = context(fresh_run(json!({})), &clock);
        ctx.info(("hello", 1));
        ctx.warn(NotJson);
        let run = ctx.finish();
        assert_eq!(run.count("Log"), 2);
        let payloads: Vec<_> = run
            .operations
            .iter()
            .filter_map(|op| match &op.event {
                OperationEvent::Log { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads[0], json!(["hello", 1]));
        assert_eq!(payloads[1], json!("NotJson"));

        let ctx = context(run.clone(), &clock);
        ctx.info(("hello", 1));
        ctx.warn(NotJson);
        assert_eq!(ctx.finish(), run);
    }

    #[test]
    fn stopped_run_is_kept_whole() {
        let clock = ManualClock::default();
        let mut run = fresh_run(json!({"a": 1}));
        run.push(
            clock.now(),
            OperationEvent::Stop {
                result: StopResult::Ok(json!(1)),
            },
        );
        let ctx = context(run.clone(), &clock);
        assert_eq!(ctx.kwargs(), &json!({"a": 1}));
        assert_eq!(ctx.finish(), run);
    }

    #[test]
    fn missing_start_is_rejected() {
        let run = Run::new(RunId::generate("bare").unwrap());
        let err = Context::builder(run, Arc::new(ManualClock::default()))
            .build()
            .unwrap_err();
        assert!(matches!(err, JournalError::MissingStart { .. }));
    }
}
