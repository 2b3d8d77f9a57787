use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use super::dialect::Dialect;
use crate::error::{KeelError, Result};

/// Marker line separating the up and down actions in a step file.
pub const DOWN_MARKER: &str = "-- keel:down";

/// One ordered schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStep {
    /// Unique identifier (e.g. "0002_add_rules").
    pub id: String,
    /// Schema version the database is at once this step is applied.
    pub version: String,
    /// SQL applied on upgrade.
    pub up: String,
    /// SQL applied on explicit downgrade.
    pub down: Option<String>,
}

impl MigrationStep {
    pub fn new(id: impl Into<String>, version: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            up: up.into(),
            down: None,
        }
    }

    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }

    pub fn has_down(&self) -> bool {
        self.down.is_some()
    }

    /// Build a step from a file stem and its content.
    ///
    /// The version is the stem up to the first `_` (`0002_add_rules` is
    /// version `0002`); a `-- keel:down` line splits up and down SQL.
    pub fn from_source(stem: &str, content: &str) -> Self {
        let version = stem.split_once('_').map(|(v, _)| v).unwrap_or(stem);
        let (up, down) = match find_down_marker(content) {
            Some((up, down)) => (up.trim().to_string(), Some(down.trim().to_string())),
            None => (content.trim().to_string(), None),
        };
        Self {
            id: stem.to_string(),
            version: version.to_string(),
            up,
            down,
        }
    }
}

fn find_down_marker(content: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if line.trim().eq_ignore_ascii_case(DOWN_MARKER) {
            return Some((&content[..offset], &content[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

/// A strictly ordered list of steps with unique ids and versions.
#[derive(Debug, Clone, Default)]
pub struct StepSet {
    steps: Vec<MigrationStep>,
}

impl StepSet {
    pub fn new(steps: Vec<MigrationStep>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut versions = HashSet::new();
        for step in &steps {
            if !ids.insert(step.id.as_str()) {
                return Err(KeelError::Validation(format!(
                    "duplicate migration step id '{}'",
                    step.id
                )));
            }
            if !versions.insert(step.version.as_str()) {
                return Err(KeelError::Validation(format!(
                    "migration steps claim the same version '{}' (step '{}')",
                    step.version, step.id
                )));
            }
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn latest(&self) -> Option<&MigrationStep> {
        self.steps.last()
    }

    /// Position of the step producing `version`.
    pub fn position_of_version(&self, version: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.version == version)
    }

    /// Position of a step by version or id.
    pub fn position_of(&self, target: &str) -> Option<usize> {
        self.position_of_version(target)
            .or_else(|| self.steps.iter().position(|s| s.id == target))
    }

    pub fn get(&self, index: usize) -> Option<&MigrationStep> {
        self.steps.get(index)
    }
}

/// Load migration steps from a directory.
///
/// Every `*.sql` file is a step, ordered by file name:
/// - `0001_create_accounts.sql`
/// - `0002_add_rules.sql`
pub fn load_steps_from_dir(dir: &Path) -> Result<StepSet> {
    if !dir.exists() {
        debug!("Migrations directory does not exist: {:?}", dir);
        return StepSet::new(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "sql").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();

    let mut steps = Vec::with_capacity(files.len());
    for path in files {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| KeelError::Validation(format!("invalid migration filename {:?}", path)))?;
        let content = std::fs::read_to_string(&path)?;
        steps.push(MigrationStep::from_source(stem, &content));
    }

    debug!("Loaded {} migration steps from {:?}", steps.len(), dir);
    StepSet::new(steps)
}

/// Split SQL into statements on `;`.
///
/// Semicolons inside single-quoted literals, `--` comments and PostgreSQL
/// dollar-quoted bodies (`$$ ... $$`, `$tag$ ... $tag$`) do not split.
/// Statements made only of comments are dropped.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut dollar_tag: Option<String> = None;
    let mut in_literal = false;
    let mut in_comment = false;
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_comment {
            current.push(c);
            if c == '\n' {
                in_comment = false;
            }
            i += 1;
            continue;
        }

        if let Some(tag) = &dollar_tag {
            if c == '$' && starts_with_at(&chars, i, tag) {
                current.push_str(tag);
                i += tag.chars().count();
                dollar_tag = None;
            } else {
                current.push(c);
                i += 1;
            }
            continue;
        }

        if in_literal {
            current.push(c);
            if c == '\'' {
                in_literal = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' => in_literal = true,
            '-' if chars.get(i + 1) == Some(&'-') => in_comment = true,
            '$' => {
                if let Some(tag) = dollar_tag_at(&chars, i) {
                    current.push_str(&tag);
                    i += tag.chars().count();
                    dollar_tag = Some(tag);
                    continue;
                }
            }
            ';' => {
                push_statement(&mut statements, &current);
                current.clear();
                i += 1;
                continue;
            }
            _ => {}
        }
        current.push(c);
        i += 1;
    }
    push_statement(&mut statements, &current);

    statements
}

/// Split SQL into the statements a `dialect` executes one at a time.
///
/// On Oracle, PL/SQL blocks (`BEGIN`, `DECLARE`, `CREATE PROCEDURE`,
/// `CREATE PACKAGE BODY`, ...) contain semicolons of their own, so the
/// pieces of a block are joined back into one statement ending in `END;`.
/// Other dialects split exactly like [`split_sql_statements`].
pub fn split_statements(sql: &str, dialect: Dialect) -> Vec<String> {
    let pieces = split_sql_statements(sql);
    if dialect != Dialect::Oracle {
        return pieces;
    }

    let mut statements = Vec::new();
    let mut open: Option<PlsqlBlock> = None;
    for piece in pieces {
        let words = plsql_words(&piece);
        let mut block = match open.take() {
            Some(block) => block,
            None => match block_depth_at_open(&words) {
                Some(depth) => PlsqlBlock::new(depth),
                None => {
                    statements.push(piece);
                    continue;
                }
            },
        };
        block.push(piece, &words);
        if block.is_closed() {
            statements.push(block.finish());
        } else {
            open = Some(block);
        }
    }
    if let Some(block) = open {
        statements.push(block.finish());
    }

    statements
}

struct PlsqlBlock {
    parts: Vec<String>,
    depth: i32,
    seen_end: bool,
}

impl PlsqlBlock {
    fn new(depth: i32) -> Self {
        Self {
            parts: Vec::new(),
            depth,
            seen_end: false,
        }
    }

    fn push(&mut self, piece: String, words: &[String]) {
        let mut i = 0;
        while i < words.len() {
            match words[i].as_str() {
                "BEGIN" | "CASE" => self.depth += 1,
                "END" => match words.get(i + 1).map(String::as_str) {
                    // IF and LOOP never opened a level
                    Some("IF") | Some("LOOP") => i += 1,
                    Some("CASE") => {
                        self.depth -= 1;
                        i += 1;
                    }
                    _ => {
                        self.depth -= 1;
                        self.seen_end = true;
                    }
                },
                _ => {}
            }
            i += 1;
        }
        self.parts.push(piece);
    }

    fn is_closed(&self) -> bool {
        self.seen_end && self.depth <= 0
    }

    fn finish(self) -> String {
        format!("{};", self.parts.join(";\n"))
    }
}

/// Nesting depth a PL/SQL unit starts at, or `None` for plain SQL.
///
/// Package and type bodies close with an `END` that has no `BEGIN`.
fn block_depth_at_open(words: &[String]) -> Option<i32> {
    let mut rest = words.iter().map(String::as_str);
    match rest.next()? {
        "BEGIN" | "DECLARE" => return Some(0),
        "CREATE" => {}
        _ => return None,
    }
    let mut kind = rest.next()?;
    if kind == "OR" {
        rest.next()?;
        kind = rest.next()?;
    }
    if kind == "EDITIONABLE" || kind == "NONEDITIONABLE" {
        kind = rest.next()?;
    }
    match kind {
        "PROCEDURE" | "FUNCTION" | "TRIGGER" => Some(0),
        "PACKAGE" => Some(1),
        "TYPE" => (rest.next() == Some("BODY")).then_some(1),
        _ => None,
    }
}

/// Upper-cased words of `sql`, skipping literals, quoted identifiers and
/// comments.
fn plsql_words(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut words = Vec::new();
    let mut word = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_alphanumeric() || c == '_' || c == '$' || c == '#' {
            word.extend(c.to_uppercase());
            i += 1;
            continue;
        }
        if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }
        match c {
            '\'' | '"' => {
                i += 1;
                while i < chars.len() && chars[i] != c {
                    i += 1;
                }
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    if !word.is_empty() {
        words.push(word);
    }

    words
}

fn starts_with_at(chars: &[char], at: usize, tag: &str) -> bool {
    tag.chars()
        .enumerate()
        .all(|(offset, t)| chars.get(at + offset) == Some(&t))
}

/// A `$tag$` opener at `at`, where the tag is empty or an identifier.
fn dollar_tag_at(chars: &[char], at: usize) -> Option<String> {
    let mut tag = String::from("$");
    let mut j = at + 1;
    while let Some(&c) = chars.get(j) {
        if c == '$' {
            tag.push('$');
            return Some(tag);
        }
        if !(c.is_alphanumeric() || c == '_') || (j == at + 1 && c.is_ascii_digit()) {
            return None;
        }
        tag.push(c);
        j += 1;
    }
    None
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let stmt = raw.trim();
    let only_comments = stmt.lines().all(|l| {
        let l = l.trim();
        l.is_empty() || l.starts_with("--")
    });
    if !only_comments {
        statements.push(stmt.to_string());
    }
}
