//! Periodic convergence loop
//!
//! A [`Manager`] owns one kernel connection and one reconciliation target (a
//! [`Set`] or a [`RuleTarget`]). Every interval it asks a caller-supplied
//! update function for the desired state, queues the delta against the
//! kernel and commits it.
//!
//! ```text
//! Idle ──timer──▶ Polling ──update fn──▶ Reconciling ──delta──▶ Flushing ──commit──▶ Idle
//!                    │ error                  │ error / unchanged
//!                    └────────▶ Idle ◀────────┘
//! ```
//!
//! Failures never stop the loop: they are logged through the injected
//! [`Logger`], counted through the injected [`Metrics`], and the tick is
//! abandoned. The loop ends on the shutdown channel, SIGINT or SIGTERM,
//! always after the in-flight tick has completed.

use crate::core::conn::Conn;
use crate::core::error::{NftablesErrorPattern, Result};
use crate::core::nft_json::NftConn;
use crate::core::objects::Table;
use crate::core::rule::{RuleData, RuleTarget};
use crate::core::set::{Set, UpdateSummary};
use crate::core::set_data::SetData;
use crate::telemetry::{Logger, Metrics, NoopMetrics, TracingLogger, prefix};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Error type returned by update functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Produces the desired state on every tick
pub type UpdateFn<T> = Box<dyn FnMut() -> std::result::Result<Vec<T>, BoxError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ManagerKind {
    Set,
    Rule,
}

/// One usage counter reading, tagged with what it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSample {
    pub tags: Vec<String>,
    pub bytes: u64,
    pub packets: u64,
}

/// Something a [`Manager`] can converge
#[async_trait]
pub trait Reconcile: Send + Sync {
    type Item: Send;

    fn kind(&self) -> ManagerKind;

    fn table(&self) -> &Table;

    /// Set or chain name
    fn name(&self) -> &str;

    /// Tags carried by every metric about this target
    fn tags(&self) -> Vec<String> {
        let object = match self.kind() {
            ManagerKind::Set => "set",
            ManagerKind::Rule => "chain",
        };
        vec![
            format!("manager_type:{}", self.kind()),
            format!("table:{}", self.table().name),
            format!("{object}:{}", self.name()),
        ]
    }

    /// Committed usage counters
    async fn usage(&self, conn: &mut dyn Conn) -> Result<Vec<UsageSample>>;

    /// Queues whatever turns the committed state into `desired`
    async fn reconcile(&mut self, conn: &mut dyn Conn, desired: Vec<Self::Item>)
    -> Result<UpdateSummary>;

    /// Called after a failed commit when the manager clears on error
    fn commit_failed(&mut self) {}
}

#[async_trait]
impl Reconcile for Set {
    type Item = SetData;

    fn kind(&self) -> ManagerKind {
        ManagerKind::Set
    }

    fn table(&self) -> &Table {
        &self.spec().table
    }

    fn name(&self) -> &str {
        &self.spec().name
    }

    async fn usage(&self, conn: &mut dyn Conn) -> Result<Vec<UsageSample>> {
        Ok(self
            .get_counted_set_data(conn)
            .await?
            .into_iter()
            .filter_map(|c| {
                c.counter.map(|counter| UsageSample {
                    tags: vec![format!("element:{}", c.data)],
                    bytes: counter.bytes,
                    packets: counter.packets,
                })
            })
            .collect())
    }

    async fn reconcile(&mut self, conn: &mut dyn Conn, desired: Vec<SetData>) -> Result<UpdateSummary> {
        self.update_elements(conn, &desired).await
    }

    fn commit_failed(&mut self) {
        self.invalidate_cache();
    }
}

#[async_trait]
impl Reconcile for RuleTarget {
    type Item = RuleData;

    fn kind(&self) -> ManagerKind {
        ManagerKind::Rule
    }

    fn table(&self) -> &Table {
        RuleTarget::table(self)
    }

    fn name(&self) -> &str {
        self.chain()
    }

    async fn usage(&self, conn: &mut dyn Conn) -> Result<Vec<UsageSample>> {
        Ok(self
            .get_rule_usage_counters(conn)
            .await?
            .into_iter()
            .map(|u| {
                let mut tags = vec![format!("rule:{}", u.id), format!("verdict:{}", u.verdict)];
                if let Some(protocol) = u.protocol {
                    tags.push(format!("protocol:{protocol}"));
                }
                UsageSample {
                    tags,
                    bytes: u.bytes,
                    packets: u.packets,
                }
            })
            .collect())
    }

    async fn reconcile(&mut self, conn: &mut dyn Conn, desired: Vec<RuleData>) -> Result<UpdateSummary> {
        self.update(conn, &desired).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ManagerState {
    #[default]
    Idle,
    Polling,
    Reconciling,
    Flushing,
    Stopped,
}

/// How a single tick ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The update function returned an error
    UpdateFailed,
    /// Computing or queueing the delta failed; the queue was discarded
    ApplyFailed,
    /// Already converged, nothing committed
    Unchanged,
    Committed(UpdateSummary),
    CommitFailed,
}

pub struct Manager<T: Reconcile, C: Conn = NftConn> {
    target: T,
    conn: C,
    update: UpdateFn<T::Item>,
    interval: Duration,
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn Metrics>,
    clear_on_error: bool,
    state: ManagerState,
}

pub type SetManager<C = NftConn> = Manager<Set, C>;
pub type RuleManager<C = NftConn> = Manager<RuleTarget, C>;

impl<T: Reconcile, C: Conn> fmt::Debug for Manager<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("kind", &self.target.kind())
            .field("table", &self.target.table().name)
            .field("name", &self.target.name())
            .field("interval", &self.interval)
            .field("clear_on_error", &self.clear_on_error)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<T: Reconcile> Manager<T, NftConn> {
    /// Opens a dedicated nft connection for the manager
    pub async fn connect<F>(target: T, update: F, interval: Duration) -> Result<Self>
    where
        F: FnMut() -> std::result::Result<Vec<T::Item>, BoxError> + Send + 'static,
    {
        let conn = NftConn::connect().await?;
        Ok(Self::new(target, conn, update, interval))
    }
}

impl<T: Reconcile, C: Conn> Manager<T, C> {
    /// Creates a manager logging through `tracing` with no metrics.
    ///
    /// `update` runs inline on the task driving the manager, so it should
    /// return promptly. A feed that blocks for long belongs on its own
    /// thread, with the update function reading its latest result.
    pub fn new<F>(target: T, conn: C, update: F, interval: Duration) -> Self
    where
        F: FnMut() -> std::result::Result<Vec<T::Item>, BoxError> + Send + 'static,
    {
        Self {
            target,
            conn,
            update: Box::new(update),
            interval,
            logger: Arc::new(TracingLogger),
            metrics: Arc::new(NoopMetrics),
            clear_on_error: false,
            state: ManagerState::Idle,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Resets the target's cached state after a failed commit
    pub fn clear_on_error(mut self, clear: bool) -> Self {
        self.clear_on_error = clear;
        self
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    fn describe(&self) -> String {
        format!(
            "{} {}/{}",
            self.target.kind(),
            self.target.table().name,
            self.target.name()
        )
    }

    fn tags(&self, extra: &[String]) -> Vec<String> {
        let mut tags = extra.to_vec();
        tags.extend(self.target.tags());
        tags
    }

    fn count(&self, name: &str, value: i64, extra: &[String]) {
        let tags = self.tags(extra);
        if let Err(e) = self.metrics.count(&prefix(name), value, &tags) {
            self.logger
                .warn(&format!("error sending {name} metric: {e}"));
        }
    }

    fn count_success(&self, name: &str, success: bool) {
        self.count(name, 1, &[format!("success:{success}")]);
    }

    fn log_failure(&self, what: &str, err: &dyn fmt::Display) {
        let msg = err.to_string();
        let line = format!("error {what} {}: {msg}", self.describe());
        match NftablesErrorPattern::hint(&msg) {
            Some(hint) => self.logger.error(&format!("{line} ({hint})")),
            None => self.logger.error(&line),
        }
    }

    fn emit_usage(&self, samples: Vec<UsageSample>) {
        for sample in samples {
            let bytes = i64::try_from(sample.bytes).unwrap_or(i64::MAX);
            let packets = i64::try_from(sample.packets).unwrap_or(i64::MAX);
            self.count("usage.bytes", bytes, &sample.tags);
            self.count("usage.packets", packets, &sample.tags);
        }
    }

    /// Runs one poll/reconcile/commit cycle and returns to idle
    pub async fn tick(&mut self) -> TickOutcome {
        let started = Instant::now();
        let outcome = self.run_tick().await;
        self.state = ManagerState::Idle;

        let tags = self.tags(&[]);
        if let Err(e) = self
            .metrics
            .timing(&prefix("manager_loop_tick_duration"), started.elapsed(), &tags)
        {
            self.logger
                .warn(&format!("error sending manager_loop_tick_duration metric: {e}"));
        }
        outcome
    }

    async fn run_tick(&mut self) -> TickOutcome {
        self.state = ManagerState::Polling;

        match self.target.usage(&mut self.conn).await {
            Ok(samples) => self.emit_usage(samples),
            Err(e) => self.logger.warn(&format!(
                "error reading usage counters for {}: {e}",
                self.describe()
            )),
        }

        let desired = match (self.update)() {
            Ok(desired) => {
                self.count_success("manager_loop_update_func", true);
                desired
            }
            Err(e) => {
                self.log_failure("running update function for", &e);
                self.count_success("manager_loop_update_func", false);
                return TickOutcome::UpdateFailed;
            }
        };

        self.state = ManagerState::Reconciling;
        let summary = match self.target.reconcile(&mut self.conn, desired).await {
            Ok(summary) => {
                self.count_success("manager_loop_update_data", true);
                summary
            }
            Err(e) => {
                self.conn.discard();
                self.log_failure("updating", &e);
                self.count_success("manager_loop_update_data", false);
                return TickOutcome::ApplyFailed;
            }
        };

        if !summary.modified {
            self.logger
                .debug(&format!("{} already converged", self.describe()));
            return TickOutcome::Unchanged;
        }

        self.state = ManagerState::Flushing;
        if let Err(e) = self.conn.commit().await {
            self.log_failure("flushing", &e);
            self.count_success("manager_loop_flush", false);
            if self.clear_on_error {
                self.logger.warn(&format!(
                    "clear on error for {}, next run starts from scratch",
                    self.describe()
                ));
                self.target.commit_failed();
            }
            return TickOutcome::CommitFailed;
        }

        let added = i64::try_from(summary.added).unwrap_or(i64::MAX);
        let removed = i64::try_from(summary.removed).unwrap_or(i64::MAX);
        self.count("manager_loop_update_data_added", added, &[]);
        self.count("manager_loop_update_data_deleted", removed, &[]);
        self.count_success("manager_loop_flush", true);
        self.logger.info(&format!(
            "committed {}: {} added, {} removed",
            self.describe(),
            summary.added,
            summary.removed
        ));
        TickOutcome::Committed(summary)
    }

    /// Ticks every interval until shutdown, SIGINT or SIGTERM.
    ///
    /// The first tick fires one interval after the call. A dropped shutdown
    /// sender never stops the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        self.logger
            .info(&format!("starting manager for {}", self.describe()));

        let mut timer = time::interval_at(Instant::now() + self.interval, self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut interrupt = self.listen(SignalKind::interrupt(), "SIGINT");
        let mut terminate = self.listen(SignalKind::terminate(), "SIGTERM");
        let mut watching = true;

        loop {
            if *shutdown.borrow() {
                self.logger.info(&format!(
                    "got shutdown, stopping update loop for {}",
                    self.describe()
                ));
                break;
            }

            tokio::select! {
                changed = shutdown.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    }
                }
                () = recv(&mut interrupt) => {
                    self.logger.info(&format!("got SIGINT, stopping update loop for {}", self.describe()));
                    break;
                }
                () = recv(&mut terminate) => {
                    self.logger.info(&format!("got SIGTERM, stopping update loop for {}", self.describe()));
                    break;
                }
                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }

        self.state = ManagerState::Stopped;
        self
    }

    fn listen(&self, kind: SignalKind, name: &str) -> Option<Signal> {
        match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                self.logger
                    .warn(&format!("cannot listen for {name}: {e}"));
                None
            }
        }
    }
}

impl<T, C> Manager<T, C>
where
    T: Reconcile + 'static,
    C: Conn + 'static,
{
    /// Runs the loop on its own task; the handle yields the stopped manager
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Self> {
        tokio::spawn(self.run(shutdown))
    }
}

async fn recv(signal: &mut Option<Signal>) {
    match signal {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
