//! In-memory database double for exercising migrations without a server.
//!
//! The mock understands the statements the adapter, ledger and config
//! table issue: table creation and existence checks, ledger reads and
//! writes, config table reads, advisory locks and transaction control. Any other statement is recorded and succeeds.
//! On Postgres a failed statement aborts the open transaction until it is
//! rolled back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use keel_core::migration::Dialect;
use keel_core::{KeelError, Result};

use crate::db::DbHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LedgerRow {
    version: String,
    step_id: String,
    applied_at: String,
}

#[derive(Default)]
struct MockState {
    next_session: u64,
    tables: HashSet<String>,
    ledger: HashMap<String, LedgerRow>,
    executed: Vec<String>,
    locks: HashMap<String, u64>,
    failures: Vec<String>,
    delays: Vec<(String, Duration)>,
    commits: usize,
    rollbacks: usize,
    configs: HashMap<(String, String), String>,
    config_reads: usize,
}

/// Shared in-memory database. Clones and handles all see the same state.
#[derive(Clone)]
pub struct MockDatabase {
    dialect: Dialect,
    state: Arc<Mutex<MockState>>,
}

impl MockDatabase {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Open a new session.
    pub fn handle(&self) -> MockHandle {
        let session = {
            let mut state = self.lock();
            state.next_session += 1;
            state.next_session
        };
        MockHandle {
            dialect: self.dialect,
            session,
            state: Arc::clone(&self.state),
            tx: None,
        }
    }

    /// Committed statements, excluding ledger bookkeeping, locks and
    /// transaction control.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Committed ledger version of a schema.
    pub fn ledger_version(&self, schema: &str) -> Option<String> {
        self.lock().ledger.get(schema).map(|row| row.version.clone())
    }

    /// Write a ledger row directly, as another writer would.
    pub fn set_ledger_version(&self, schema: &str, version: &str, table: &str) {
        let mut state = self.lock();
        state.tables.insert(table.to_string());
        state.ledger.insert(
            schema.to_string(),
            LedgerRow {
                version: version.to_string(),
                step_id: version.to_string(),
                applied_at: "1970-01-01T00:00:00+00:00".to_string(),
            },
        );
    }

    /// Store a row of the config table.
    pub fn set_config(&self, section: &str, opt: &str, value: &str) {
        self.lock()
            .configs
            .insert((section.to_string(), opt.to_string()), value.to_string());
    }

    /// Number of config table queries served.
    pub fn config_reads(&self) -> usize {
        self.lock().config_reads
    }

    /// Make every statement containing `fragment` fail.
    pub fn fail_on(&self, fragment: &str) {
        self.lock().failures.push(fragment.to_string());
    }

    /// Make every statement containing `fragment` take `delay` to run.
    pub fn delay_on(&self, fragment: &str, delay: Duration) {
        self.lock().delays.push((fragment.to_string(), delay));
    }

    /// Hold the lock on `key` from an outside session.
    pub fn hold_lock(&self, key: &str) {
        self.lock().locks.insert(key.to_string(), 0);
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains(table)
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Transaction {
    statements: Vec<String>,
    ledger: HashMap<String, Option<LedgerRow>>,
    aborted: bool,
}

/// One session on a [`MockDatabase`].
pub struct MockHandle {
    dialect: Dialect,
    session: u64,
    state: Arc<Mutex<MockState>>,
    tx: Option<Transaction>,
}

impl MockHandle {
    fn read_ledger(&self, state: &MockState, schema: &str) -> Option<LedgerRow> {
        if let Some(tx) = &self.tx {
            if let Some(pending) = tx.ledger.get(schema) {
                return pending.clone();
            }
        }
        state.ledger.get(schema).cloned()
    }

    fn write_ledger(&mut self, state: &mut MockState, schema: &str, row: Option<LedgerRow>) {
        match &mut self.tx {
            Some(tx) => {
                tx.ledger.insert(schema.to_string(), row);
            }
            None => match row {
                Some(row) => {
                    state.ledger.insert(schema.to_string(), row);
                }
                None => {
                    state.ledger.remove(schema);
                }
            },
        }
    }

    fn delay_for(&self, sql: &str) -> Option<Duration> {
        let state = lock_state(&self.state);
        state
            .delays
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, delay)| *delay)
    }

    fn check_aborted(&self, sql: &str) -> Result<()> {
        let aborted = self.tx.as_ref().is_some_and(|tx| tx.aborted);
        let upper = sql.trim().to_ascii_uppercase();
        if aborted && upper != "ROLLBACK" && upper != "COMMIT" {
            return Err(KeelError::Backend(
                "current transaction is aborted, commands ignored until end of transaction block".into(),
            ));
        }
        Ok(())
    }

    fn note_result<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() && self.dialect == Dialect::Postgres {
            if let Some(tx) = &mut self.tx {
                tx.aborted = true;
            }
        }
        result
    }

    fn run_statement(&mut self, sql: &str, params: &[String]) -> Result<u64> {
        let state_arc = Arc::clone(&self.state);
        let mut state = lock_state(&state_arc);

        if state.failures.iter().any(|f| sql.contains(f.as_str())) {
            return Err(KeelError::Backend(format!("mock failure: {}", sql)));
        }

        let upper = sql.trim().to_ascii_uppercase();
        match upper.as_str() {
            "BEGIN" | "START TRANSACTION" => {
                self.tx = Some(Transaction::default());
                return Ok(0);
            }
            "COMMIT" => {
                if self.tx.as_ref().is_some_and(|tx| tx.aborted) {
                    self.tx = None;
                    state.rollbacks += 1;
                    return Ok(0);
                }
                if let Some(tx) = self.tx.take() {
                    state.executed.extend(tx.statements);
                    for (schema, row) in tx.ledger {
                        match row {
                            Some(row) => {
                                state.ledger.insert(schema, row);
                            }
                            None => {
                                state.ledger.remove(&schema);
                            }
                        }
                    }
                }
                state.commits += 1;
                return Ok(0);
            }
            "ROLLBACK" => {
                if let Some(tx) = self.tx.take() {
                    // Without transactional DDL the schema changes already happened
                    if !self.dialect.supports_transactional_ddl() {
                        state.executed.extend(tx.statements);
                    }
                }
                state.rollbacks += 1;
                return Ok(0);
            }
            _ => {}
        }

        if upper.starts_with("CREATE TABLE") {
            if let Some(name) = created_table(sql) {
                state.tables.insert(name);
            }
        }

        if !sql.contains("schema_name") {
            match &mut self.tx {
                Some(tx) => tx.statements.push(sql.to_string()),
                None => state.executed.push(sql.to_string()),
            }
            return Ok(0);
        }

        let param = |idx: usize| params.get(idx).cloned().unwrap_or_default();
        if upper.starts_with("INSERT") {
            let schema = param(0);
            if self.read_ledger(&state, &schema).is_some() {
                return Err(KeelError::Backend(format!(
                    "duplicate key value for schema_name '{}'",
                    schema
                )));
            }
            let row = LedgerRow {
                version: param(1),
                step_id: param(2),
                applied_at: param(3),
            };
            self.write_ledger(&mut state, &schema, Some(row));
            Ok(1)
        } else if upper.starts_with("UPDATE") {
            let schema = param(3);
            match self.read_ledger(&state, &schema) {
                Some(current) if current.version == param(4) => {
                    let row = LedgerRow {
                        version: param(0),
                        step_id: param(1),
                        applied_at: param(2),
                    };
                    self.write_ledger(&mut state, &schema, Some(row));
                    Ok(1)
                }
                _ => Ok(0),
            }
        } else if upper.starts_with("DELETE") {
            let schema = param(0);
            match self.read_ledger(&state, &schema) {
                Some(current) if current.version == param(1) => {
                    self.write_ledger(&mut state, &schema, None);
                    Ok(1)
                }
                _ => Ok(0),
            }
        } else {
            Ok(0)
        }
    }

    fn run_query(&mut self, sql: &str, params: &[String]) -> Result<Option<Vec<String>>> {
        let state_arc = Arc::clone(&self.state);
        let mut state = lock_state(&state_arc);

        if state.failures.iter().any(|f| sql.contains(f.as_str())) {
            return Err(KeelError::Backend(format!("mock failure: {}", sql)));
        }

        let first = params.first().cloned().unwrap_or_default();
        if sql.contains("information_schema.tables")
            || sql.contains("sqlite_master")
            || sql.contains("user_tables")
        {
            let present = state.tables.contains(&first);
            return Ok(present.then(|| vec!["present".to_string()]));
        }

        if let Some(key) = lock_target(sql, params, &["pg_try_advisory_lock(", "GET_LOCK("]) {
            let answer = match state.locks.get(&key) {
                Some(owner) if *owner != self.session => "busy",
                _ => {
                    state.locks.insert(key, self.session);
                    "acquired"
                }
            };
            return Ok(Some(vec![answer.to_string()]));
        }

        if let Some(key) = lock_target(sql, params, &["pg_advisory_unlock(", "RELEASE_LOCK("]) {
            let released = state.locks.get(&key) == Some(&self.session);
            if released {
                state.locks.remove(&key);
            }
            let answer = if released { "released" } else { "not held" };
            return Ok(Some(vec![answer.to_string()]));
        }

        if sql.contains(" opt = ") {
            state.config_reads += 1;
            let opt = params.get(1).cloned().unwrap_or_default();
            return Ok(state.configs.get(&(first, opt)).map(|value| vec![value.clone()]));
        }

        if sql.contains("version_num") && sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            return Ok(self
                .read_ledger(&state, &first)
                .map(|row| vec![row.version, row.step_id, row.applied_at]));
        }

        Ok(None)
    }
}

impl DbHandle for MockHandle {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [String]) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            if let Some(delay) = self.delay_for(sql) {
                tokio::time::sleep(delay).await;
            }
            self.check_aborted(sql)?;
            let result = self.run_statement(sql, params);
            self.note_result(result)
        })
    }

    fn fetch_row<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [String],
    ) -> BoxFuture<'a, Result<Option<Vec<String>>>> {
        Box::pin(async move {
            if let Some(delay) = self.delay_for(sql) {
                tokio::time::sleep(delay).await;
            }
            self.check_aborted(sql)?;
            let result = self.run_query(sql, params);
            self.note_result(result)
        })
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        // Session locks end with the session
        let mut state = lock_state(&self.state);
        let session = self.session;
        state.locks.retain(|_, owner| *owner != session);
    }
}

fn created_table(sql: &str) -> Option<String> {
    let rest = sql.trim_start();
    let rest = rest.get("CREATE TABLE".len()..)?.trim_start();
    let rest = rest
        .strip_prefix("IF NOT EXISTS")
        .or_else(|| rest.strip_prefix("if not exists"))
        .unwrap_or(rest)
        .trim_start();
    let name: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '(')
        .filter(|c| !matches!(c, '"' | '`'))
        .collect();
    (!name.is_empty()).then_some(name)
}

fn lock_target(sql: &str, params: &[String], functions: &[&str]) -> Option<String> {
    for function in functions {
        if let Some(start) = sql.find(function) {
            let rest = &sql[start + function.len()..];
            let arg = rest.split([')', ',']).next().unwrap_or_default().trim();
            if arg == "?" {
                return params.first().cloned();
            }
            return Some(arg.to_string());
        }
    }
    None
}
