//! Migration runner with single-writer locking.
//!
//! A run takes the backend's advisory lock for (url, schema) where one
//! exists, checks that the ledger has not moved since planning, then applies
//! each step and advances the ledger with compare-and-set.

use std::time::{Duration, Instant};

use keel_core::config::{DatabaseSettings, MigrationSettings};
use keel_core::migration::{
    plan_downgrade, plan_upgrade, Direction, MigrationPlan, PlannedStep, StepSet,
};
use keel_core::{KeelError, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::BackendAdapter;
use crate::db::DbHandle;
use crate::ledger::{Ledger, LedgerEntry, LedgerTarget};

/// Lifecycle of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Planning,
    Applying,
    Committed,
    RolledBack,
}

/// Knobs for a run.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// One transaction per step instead of one for the whole plan. Only
    /// meaningful where DDL is transactional.
    pub transaction_per_step: bool,
    /// Upper bound for each step.
    pub timeout: Option<Duration>,
    /// Checked between steps.
    pub cancel: CancellationToken,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            transaction_per_step: true,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl RunnerOptions {
    pub fn from_settings(settings: &MigrationSettings) -> Self {
        Self {
            transaction_per_step: settings.transaction_per_migration,
            timeout: settings.timeout_secs.map(Duration::from_secs),
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub schema: String,
    pub direction: Direction,
    /// Step ids whose effects were committed, in execution order.
    pub applied: Vec<String>,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    /// The run stopped early on cancellation.
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Applied and pending steps of a schema.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub schema: String,
    pub current: Option<LedgerEntry>,
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}

/// Plans and applies migration steps for one schema over one session.
pub struct MigrationRunner {
    adapter: BackendAdapter,
    handle: Box<dyn DbHandle>,
    ledger: Ledger,
    steps: StepSet,
    schema: String,
    options: RunnerOptions,
    state: RunnerState,
    transitions: Vec<RunnerState>,
}

impl MigrationRunner {
    pub fn new(
        adapter: BackendAdapter,
        handle: Box<dyn DbHandle>,
        ledger: Ledger,
        steps: StepSet,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            handle,
            ledger,
            steps,
            schema: schema.into(),
            options: RunnerOptions::default(),
            state: RunnerState::Idle,
            transitions: vec![RunnerState::Idle],
        }
    }

    /// Connect to the configured migration database.
    pub async fn connect(
        settings: &MigrationSettings,
        database: &DatabaseSettings,
        steps: StepSet,
    ) -> Result<Self> {
        let adapter = BackendAdapter::from_url(&settings.url)?;
        let handle = adapter.connect(database).await?;
        Ok(Self::new(
            adapter,
            handle,
            Ledger::new(settings.version_table.clone()),
            steps,
            settings.version_table_schema.clone(),
        )
        .with_options(RunnerOptions::from_settings(settings)))
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Every state entered so far, oldest first.
    pub fn transitions(&self) -> &[RunnerState] {
        &self.transitions
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn adapter(&self) -> &BackendAdapter {
        &self.adapter
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn steps(&self) -> &StepSet {
        &self.steps
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.options.cancel.clone()
    }

    fn transition(&mut self, next: RunnerState) {
        if self.state != next {
            info!(schema = %self.schema, from = ?self.state, to = ?next, "Migration runner state changed");
            self.state = next;
            self.transitions.push(next);
        }
    }

    pub async fn current_version(&mut self) -> Result<Option<String>> {
        self.ledger
            .current_version(self.handle.as_mut(), &self.schema)
            .await
    }

    /// Steps strictly after the current version, up to `target` (latest when `None`).
    pub async fn plan(&mut self, target: Option<&str>) -> Result<MigrationPlan> {
        self.transition(RunnerState::Idle);
        self.transition(RunnerState::Planning);
        let result = match self.current_version().await {
            Ok(current) => plan_upgrade(&self.steps, &self.schema, current.as_deref(), target),
            Err(e) => Err(e),
        };
        self.transition(RunnerState::Idle);
        result
    }

    /// The last `count` applied steps, newest first.
    pub async fn plan_downgrade(&mut self, count: usize) -> Result<MigrationPlan> {
        self.transition(RunnerState::Idle);
        self.transition(RunnerState::Planning);
        let result = match self.current_version().await {
            Ok(current) => plan_downgrade(&self.steps, &self.schema, current.as_deref(), count),
            Err(e) => Err(e),
        };
        self.transition(RunnerState::Idle);
        result
    }

    /// Apply a plan computed by [`plan`](Self::plan) or
    /// [`plan_downgrade`](Self::plan_downgrade).
    pub async fn run(&mut self, plan: &MigrationPlan) -> Result<RunReport> {
        if plan.schema != self.schema {
            return Err(KeelError::Validation(format!(
                "plan targets schema '{}' but this runner manages '{}'",
                plan.schema, self.schema
            )));
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("migration_run", %run_id, schema = %self.schema, dialect = %self.adapter.dialect());
        self.run_inner(run_id, plan).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid, plan: &MigrationPlan) -> Result<RunReport> {
        let started = Instant::now();
        self.transition(RunnerState::Idle);

        if !self
            .adapter
            .try_lock(self.handle.as_mut(), &self.schema)
            .await?
        {
            return Err(KeelError::ConcurrentMigration(format!(
                "another migration holds the lock for schema '{}'",
                self.schema
            )));
        }

        self.transition(RunnerState::Applying);
        let mut report = RunReport {
            run_id,
            schema: self.schema.clone(),
            direction: plan.direction,
            applied: Vec::new(),
            from_version: plan.observed.clone(),
            to_version: plan.observed.clone(),
            cancelled: false,
            duration_ms: 0,
        };

        let result = self.apply_locked(plan, &mut report).await;

        // Always release lock, even on error
        if let Err(e) = self.adapter.unlock(self.handle.as_mut(), &self.schema).await {
            warn!("Failed to release migration lock: {}", e);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                self.transition(RunnerState::Committed);
                info!(
                    applied = report.applied.len(),
                    version = report.to_version.as_deref().unwrap_or("<base>"),
                    cancelled = report.cancelled,
                    "Migration run finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(RunnerState::RolledBack);
                Err(e)
            }
        }
    }

    async fn apply_locked(&mut self, plan: &MigrationPlan, report: &mut RunReport) -> Result<()> {
        let observed = self.current_version().await?;
        if observed != plan.observed {
            return Err(KeelError::ConcurrentMigration(format!(
                "ledger for schema '{}' moved from {} to {} since planning",
                self.schema,
                describe(plan.observed.as_deref()),
                describe(observed.as_deref())
            )));
        }

        if plan.is_empty() {
            info!("Schema is up to date");
            return Ok(());
        }

        let transactional = self.adapter.supports_transactional_ddl();
        let batch = transactional && !self.options.transaction_per_step;
        if batch {
            self.adapter.begin_transaction(self.handle.as_mut()).await?;
        }

        let mut pending = Vec::new();
        for planned in &plan.steps {
            if self.options.cancel.is_cancelled() {
                info!(remaining = plan.len() - report.applied.len() - pending.len(), "Migration run cancelled");
                report.cancelled = true;
                break;
            }

            if transactional && !batch {
                self.adapter.begin_transaction(self.handle.as_mut()).await?;
            }

            match self.apply_step_bounded(planned).await {
                Ok(()) => {
                    if transactional && !batch {
                        self.adapter.commit(self.handle.as_mut()).await?;
                        report.applied.push(planned.step.id.clone());
                        report.to_version = planned.to_version.clone();
                    } else if batch {
                        pending.push(planned);
                    } else {
                        report.applied.push(planned.step.id.clone());
                        report.to_version = planned.to_version.clone();
                    }
                }
                Err(e) => {
                    if transactional {
                        if let Err(rollback_err) = self.adapter.rollback(self.handle.as_mut()).await {
                            warn!("Failed to roll back migration step '{}': {}", planned.step.id, rollback_err);
                        }
                    } else {
                        warn!(
                            step = %planned.step.id,
                            "{} does not support transactional DDL; step '{}' may be partially applied",
                            self.adapter.dialect(),
                            planned.step.id
                        );
                    }
                    return Err(e);
                }
            }
        }

        if batch {
            self.adapter.commit(self.handle.as_mut()).await?;
            for planned in pending {
                report.applied.push(planned.step.id.clone());
                report.to_version = planned.to_version.clone();
            }
        }
        Ok(())
    }

    async fn apply_step_bounded(&mut self, planned: &PlannedStep) -> Result<()> {
        let work = apply_one(
            &self.adapter,
            &self.ledger,
            &self.steps,
            self.handle.as_mut(),
            &self.schema,
            planned,
        );
        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                KeelError::Timeout(format!(
                    "migration step '{}' exceeded {:?}",
                    planned.step.id, limit
                ))
            })?,
            None => work.await,
        }
    }

    /// Applied and pending steps relative to the ledger.
    pub async fn status(&mut self) -> Result<MigrationStatus> {
        let current = self
            .ledger
            .entry(self.handle.as_mut(), &self.schema)
            .await?;
        let version = current.as_ref().map(|e| e.version.as_str());
        let pending = plan_upgrade(&self.steps, &self.schema, version, None)?;
        let applied_count = self.steps.len() - pending.len();

        Ok(MigrationStatus {
            schema: self.schema.clone(),
            applied: self.steps.steps()[..applied_count]
                .iter()
                .map(|s| s.id.clone())
                .collect(),
            pending: pending.step_ids().into_iter().map(str::to_string).collect(),
            current,
        })
    }
}

async fn apply_one(
    adapter: &BackendAdapter,
    ledger: &Ledger,
    steps: &StepSet,
    handle: &mut dyn DbHandle,
    schema: &str,
    planned: &PlannedStep,
) -> Result<()> {
    adapter.apply_step(handle, planned).await?;
    if planned.from_version.is_none() {
        ledger.ensure_table(handle).await?;
    }
    ledger
        .record_version(
            handle,
            schema,
            planned.from_version.as_deref(),
            ledger_target(steps, planned),
        )
        .await
}

/// Ledger contents after a step. A downgrade records the step that
/// produced the version it returns to.
pub(crate) fn ledger_target<'a>(steps: &'a StepSet, planned: &'a PlannedStep) -> Option<LedgerTarget<'a>> {
    let version = planned.to_version.as_deref()?;
    let step_id = match planned.direction {
        Direction::Up => planned.step.id.as_str(),
        Direction::Down => steps
            .position_of_version(version)
            .and_then(|idx| steps.get(idx))
            .map(|s| s.id.as_str())
            .unwrap_or(version),
    };
    Some(LedgerTarget { version, step_id })
}

fn describe(version: Option<&str>) -> String {
    version
        .map(|v| format!("'{}'", v))
        .unwrap_or_else(|| "<base>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::lock_key;
    use crate::testing::MockDatabase;
    use keel_core::migration::{Dialect, MigrationStep};

    const PG_URL: &str = "postgresql+psycopg2://rucio:secret@db/rucio";

    fn three_steps() -> StepSet {
        StepSet::new(vec![
            MigrationStep::new("s1", "v1", "CREATE TABLE a (id INT)").with_down("DROP TABLE a"),
            MigrationStep::new("s2", "v2", "CREATE TABLE b (id INT)").with_down("DROP TABLE b"),
            MigrationStep::new("s3", "v3", "CREATE TABLE c (id INT)").with_down("DROP TABLE c"),
        ])
        .unwrap()
    }

    fn runner(db: &MockDatabase, url: &str) -> MigrationRunner {
        MigrationRunner::new(
            BackendAdapter::from_url(url).unwrap(),
            Box::new(db.handle()),
            Ledger::new("keel_version"),
            three_steps(),
            "dev",
        )
    }

    #[tokio::test]
    async fn test_plan_and_run_from_v1() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.set_ledger_version("dev", "v1", "keel_version");
        let mut runner = runner(&db, PG_URL);

        let plan = runner.plan(None).await.unwrap();
        assert_eq!(plan.step_ids(), vec!["s2", "s3"]);

        let report = runner.run(&plan).await.unwrap();
        assert_eq!(report.applied, vec!["s2", "s3"]);
        assert_eq!(report.to_version.as_deref(), Some("v3"));
        assert!(!report.cancelled);
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v3"));
        assert_eq!(
            db.executed(),
            vec!["CREATE TABLE b (id INT)".to_string(), "CREATE TABLE c (id INT)".to_string()]
        );
        assert_eq!(db.commits(), 2);
        assert_eq!(runner.state(), RunnerState::Committed);
        assert_eq!(runner.current_version().await.unwrap().as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn test_fresh_database_then_second_run_is_noop() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut runner = runner(&db, PG_URL);

        let plan = runner.plan(None).await.unwrap();
        assert_eq!(plan.len(), 3);
        runner.run(&plan).await.unwrap();
        assert!(db.has_table("keel_version"));
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v3"));

        let again = runner.plan(None).await.unwrap();
        assert!(again.is_empty());
        let report = runner.run(&again).await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(db.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut runner = runner(&db, PG_URL);
        assert_eq!(runner.state(), RunnerState::Idle);

        let plan = runner.plan(None).await.unwrap();
        runner.run(&plan).await.unwrap();
        assert_eq!(
            runner.transitions(),
            &[
                RunnerState::Idle,
                RunnerState::Planning,
                RunnerState::Idle,
                RunnerState::Applying,
                RunnerState::Committed,
            ]
        );
    }

    #[tokio::test]
    async fn test_divergent_history() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.set_ledger_version("dev", "v7", "keel_version");
        let mut runner = runner(&db, PG_URL);

        let err = runner.plan(None).await.unwrap_err();
        assert!(matches!(err, KeelError::DivergentHistory { .. }));
        assert!(db.executed().is_empty());
        assert!(matches!(runner.status().await, Err(KeelError::DivergentHistory { .. })));
    }

    #[tokio::test]
    async fn test_failure_keeps_last_committed_step() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.fail_on("CREATE TABLE c");
        let mut runner = runner(&db, PG_URL);

        let plan = runner.plan(None).await.unwrap();
        let err = runner.run(&plan).await.unwrap_err();
        assert!(matches!(err, KeelError::Backend(_)));
        assert_eq!(runner.state(), RunnerState::RolledBack);
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v2"));
        assert_eq!(db.rollbacks(), 1);
        assert!(!db.executed().iter().any(|s| s.contains("TABLE c")));
    }

    #[tokio::test]
    async fn test_batch_failure_commits_nothing() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.fail_on("CREATE TABLE c");
        let mut runner = runner(&db, PG_URL).with_options(RunnerOptions {
            transaction_per_step: false,
            ..RunnerOptions::default()
        });

        let plan = runner.plan(None).await.unwrap();
        assert!(runner.run(&plan).await.is_err());
        assert_eq!(db.ledger_version("dev"), None);
        assert!(db.executed().is_empty());
        assert_eq!(db.commits(), 0);
    }

    #[tokio::test]
    async fn test_batch_success_commits_once() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut runner = runner(&db, PG_URL).with_options(RunnerOptions {
            transaction_per_step: false,
            ..RunnerOptions::default()
        });

        let plan = runner.plan(None).await.unwrap();
        let report = runner.run(&plan).await.unwrap();
        assert_eq!(report.applied, vec!["s1", "s2", "s3"]);
        assert_eq!(db.commits(), 1);
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn test_non_transactional_failure_leaves_previous_step() {
        let db = MockDatabase::new(Dialect::MySql);
        db.fail_on("CREATE TABLE b");
        let mut runner = runner(&db, "mysql+pymysql://rucio:secret@db/rucio");

        let plan = runner.plan(None).await.unwrap();
        assert!(runner.run(&plan).await.is_err());
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v1"));
        assert_eq!(db.commits(), 0);
        assert_eq!(db.executed(), vec!["CREATE TABLE a (id INT)".to_string()]);
    }

    #[tokio::test]
    async fn test_held_lock_is_concurrent_migration() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut runner = runner(&db, PG_URL);
        db.hold_lock(&lock_key(runner.adapter().url().as_str(), "dev").to_string());

        let plan = runner.plan(None).await.unwrap();
        let err = runner.run(&plan).await.unwrap_err();
        assert!(matches!(err, KeelError::ConcurrentMigration(_)));
        assert_eq!(db.ledger_version("dev"), None);
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_moved_since_planning() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut runner = runner(&db, PG_URL);

        let plan = runner.plan(None).await.unwrap();
        db.set_ledger_version("dev", "v1", "keel_version");

        let err = runner.run(&plan).await.unwrap_err();
        assert!(matches!(err, KeelError::ConcurrentMigration(_)));
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v1"));
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut first = runner(&db, PG_URL);
        let plan = first.plan(Some("v1")).await.unwrap();
        first.run(&plan).await.unwrap();

        let mut second = runner(&db, PG_URL);
        let plan = second.plan(None).await.unwrap();
        let report = second.run(&plan).await.unwrap();
        assert_eq!(report.applied, vec!["s2", "s3"]);
    }

    #[tokio::test]
    async fn test_step_timeout_rolls_back() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.delay_on("CREATE TABLE b", Duration::from_millis(500));
        let mut runner = runner(&db, PG_URL).with_options(RunnerOptions {
            timeout: Some(Duration::from_millis(20)),
            ..RunnerOptions::default()
        });

        let plan = runner.plan(None).await.unwrap();
        let err = runner.run(&plan).await.unwrap_err();
        assert!(matches!(err, KeelError::Timeout(_)));
        assert_eq!(runner.state(), RunnerState::RolledBack);
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v1"));
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut runner = runner(&db, PG_URL);
        runner.cancellation_token().cancel();

        let plan = runner.plan(None).await.unwrap();
        let report = runner.run(&plan).await.unwrap();
        assert!(report.cancelled);
        assert!(report.applied.is_empty());
        assert_eq!(db.ledger_version("dev"), None);
    }

    #[tokio::test]
    async fn test_cancelled_between_steps() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.delay_on("CREATE TABLE a", Duration::from_millis(200));
        let mut runner = runner(&db, PG_URL);
        let token = runner.cancellation_token();

        let plan = runner.plan(None).await.unwrap();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let report = runner.run(&plan).await.unwrap();
        canceller.await.unwrap();

        // The step in flight finishes; later steps are skipped
        assert!(report.cancelled);
        assert_eq!(report.applied, vec!["s1"]);
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_sqlite_run_is_unsupported() {
        let db = MockDatabase::new(Dialect::Sqlite);
        let mut runner = runner(&db, "sqlite:////tmp/rucio.db");

        let plan = runner.plan(None).await.unwrap();
        assert_eq!(plan.len(), 3);
        let err = runner.run(&plan).await.unwrap_err();
        assert!(matches!(err, KeelError::UnsupportedOperation(_)));
        assert!(db.executed().is_empty());
        assert!(!db.has_table("keel_version"));
    }

    #[tokio::test]
    async fn test_downgrade() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.set_ledger_version("dev", "v3", "keel_version");
        let mut runner = runner(&db, PG_URL);

        let plan = runner.plan_downgrade(2).await.unwrap();
        let report = runner.run(&plan).await.unwrap();
        assert_eq!(report.applied, vec!["s3", "s2"]);
        assert_eq!(db.ledger_version("dev").as_deref(), Some("v1"));
        assert_eq!(
            db.executed(),
            vec!["DROP TABLE c".to_string(), "DROP TABLE b".to_string()]
        );

        let plan = runner.plan_downgrade(1).await.unwrap();
        runner.run(&plan).await.unwrap();
        assert_eq!(db.ledger_version("dev"), None);
    }

    #[tokio::test]
    async fn test_status() {
        let db = MockDatabase::new(Dialect::Postgres);
        db.set_ledger_version("dev", "v2", "keel_version");
        let mut runner = runner(&db, PG_URL);

        let status = runner.status().await.unwrap();
        assert_eq!(status.current.unwrap().version, "v2");
        assert_eq!(status.applied, vec!["s1", "s2"]);
        assert_eq!(status.pending, vec!["s3"]);
    }

    #[tokio::test]
    async fn test_plan_for_other_schema_rejected() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut runner = runner(&db, PG_URL);
        let plan = plan_upgrade(&three_steps(), "prod", None, None).unwrap();
        let err = runner.run(&plan).await.unwrap_err();
        assert!(matches!(err, KeelError::Validation(_)));
    }

    #[tokio::test]
    async fn test_report_serializes_for_cli() {
        let db = MockDatabase::new(Dialect::Postgres);
        let mut runner = runner(&db, PG_URL);
        let plan = runner.plan(Some("v1")).await.unwrap();
        let report = runner.run(&plan).await.unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["direction"], "up");
        assert_eq!(json["applied"], serde_json::json!(["s1"]));
        assert_eq!(json["to_version"], "v1");
        assert_eq!(json["from_version"], serde_json::Value::Null);
    }

    #[test]
    fn test_downgrade_ledger_target_names_previous_step() {
        let steps = three_steps();
        let plan = plan_downgrade(&steps, "dev", Some("v3"), 1).unwrap();
        let target = ledger_target(&steps, &plan.steps[0]).unwrap();
        assert_eq!(target.version, "v2");
        assert_eq!(target.step_id, "s2");
    }
}
