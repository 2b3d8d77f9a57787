//! Render a plan as a SQL script instead of executing it.

use std::fmt::Write as _;

use chrono::Utc;
use keel_core::migration::{split_statements, Dialect, Direction, MigrationPlan, StepSet};
use keel_core::Result;

use crate::backend::BackendAdapter;
use crate::ledger::Ledger;
use crate::runner::ledger_target;

/// Oracle's "name is already used by an existing object".
const ORA_NAME_IN_USE: i32 = -955;

/// One script applying `plan`: ledger table creation for a fresh schema,
/// each step's statements, and literal ledger updates.
///
/// Nothing is connected to. Dialects with transactional DDL get the whole
/// script wrapped in a single transaction.
pub fn render_offline(
    plan: &MigrationPlan,
    steps: &StepSet,
    adapter: &BackendAdapter,
    ledger: &Ledger,
) -> Result<String> {
    let dialect = adapter.dialect();
    let applied_at = Utc::now().to_rfc3339();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "-- keel offline migration: schema '{}', {} {}\n",
        plan.schema,
        dialect,
        match plan.direction {
            Direction::Up => "upgrade",
            Direction::Down => "downgrade",
        }
    );

    if plan.direction == Direction::Up && plan.observed.is_none() {
        out.push_str(&create_ledger_table(dialect, ledger));
        out.push('\n');
    }

    let transactional = adapter.supports_transactional_ddl();
    if transactional {
        if let Some(begin) = dialect.begin_statement() {
            let _ = writeln!(out, "{};\n", begin);
        }
    }

    for planned in &plan.steps {
        let _ = writeln!(
            out,
            "-- Running {} {} ({} -> {})\n",
            match planned.direction {
                Direction::Up => "upgrade",
                Direction::Down => "downgrade",
            },
            planned.step.id,
            planned.from_version.as_deref().unwrap_or("<base>"),
            planned.to_version.as_deref().unwrap_or("<base>"),
        );
        for statement in split_statements(planned.action()?, dialect) {
            out.push_str(&terminate(dialect, &statement));
            out.push('\n');
        }
        if let Some(record) = ledger.render_record(
            dialect,
            &plan.schema,
            planned.from_version.as_deref(),
            ledger_target(steps, planned),
            &applied_at,
        ) {
            let _ = writeln!(out, "{};\n", record);
        }
    }

    if transactional || dialect == Dialect::Oracle {
        out.push_str("COMMIT;\n");
    }
    Ok(out)
}

fn create_ledger_table(dialect: Dialect, ledger: &Ledger) -> String {
    let ddl = ledger.create_table_sql(dialect);
    match dialect {
        // Oracle has no IF NOT EXISTS
        Dialect::Oracle => format!(
            "BEGIN\n    EXECUTE IMMEDIATE {};\nEXCEPTION\n    WHEN OTHERS THEN\n        IF SQLCODE != {} THEN\n            RAISE;\n        END IF;\nEND;\n/\n",
            dialect.quote_literal(&ddl),
            ORA_NAME_IN_USE
        ),
        _ => format!("{};\n", ddl),
    }
}

/// Statement terminator. Oracle PL/SQL blocks already end in `END;` and
/// need a trailing `/`.
fn terminate(dialect: Dialect, statement: &str) -> String {
    if dialect == Dialect::Oracle && statement.ends_with(';') {
        format!("{}\n/\n", statement)
    } else {
        format!("{};\n", statement)
    }
}
