//! SQL execution against the project database with a production guard.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::util::blocking_with_timeout;
use crate::{Error, Result};

/// Statement keywords refused in production mode.
const DESTRUCTIVE_KEYWORDS: &[&str] = &["DROP", "TRUNCATE", "DELETE", "UPDATE"];

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub rows_affected: usize,
}

/// Refuse any statement in `query` that uses a destructive keyword.
/// String literals and comments are ignored when looking for keywords.
pub fn screen_query(query: &str, production: bool) -> Result<()> {
    if query.trim().is_empty() {
        return Err(Error::Validation("empty query".into()));
    }
    if !production {
        return Ok(());
    }
    for word in sql_words(query) {
        let upper = word.to_ascii_uppercase();
        if DESTRUCTIVE_KEYWORDS.contains(&upper.as_str()) {
            return Err(Error::blocked(
                "query_database",
                format!("{} statements are not allowed in production mode", upper),
            ));
        }
    }
    Ok(())
}

enum SqlToken<'a> {
    Word(&'a str),
    /// Byte offset of a statement-separating `;`.
    Separator(usize),
}

/// Words and statement separators of `sql`, skipping quoted
/// literals/identifiers and comments.
fn sql_tokens(sql: &str) -> Vec<SqlToken<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\'' | b'"' | b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != c {
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            b';' => {
                tokens.push(SqlToken::Separator(i));
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(SqlToken::Word(&sql[start..i]));
            }
            _ => i += 1,
        }
    }
    tokens
}

fn sql_words(sql: &str) -> impl Iterator<Item = &str> {
    sql_tokens(sql).into_iter().filter_map(|t| match t {
        SqlToken::Word(w) => Some(w),
        SqlToken::Separator(_) => None,
    })
}

/// Statements of `sql` that contain at least one keyword. Empty or
/// comment-only pieces between separators are dropped.
fn statements(sql: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut has_word = false;
    for token in sql_tokens(sql) {
        match token {
            SqlToken::Word(_) => has_word = true,
            SqlToken::Separator(at) => {
                if has_word {
                    out.push(sql[start..at].trim());
                }
                start = at + 1;
                has_word = false;
            }
        }
    }
    if has_word {
        out.push(sql[start..].trim());
    }
    out
}

#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    timeout: Duration,
}

impl Database {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn query(&self, query: &str) -> Result<QueryResult> {
        let path = self.path.clone();
        let query = query.to_string();
        blocking_with_timeout(self.timeout, move || run_query(&path, &query)).await
    }
}

fn run_query(path: &Path, query: &str) -> Result<QueryResult> {
    let conn = Connection::open(path)?;
    let single = match statements(query).as_slice() {
        [] => return Err(Error::Validation("query has no statements".into())),
        [single] => *single,
        _ => {
            let before = conn.total_changes();
            conn.execute_batch(query)?;
            return Ok(QueryResult {
                rows_affected: (conn.total_changes() - before) as usize,
                ..Default::default()
            });
        }
    };

    let mut stmt = conn.prepare(single)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    if columns.is_empty() {
        let rows_affected = stmt.execute([])?;
        return Ok(QueryResult {
            rows_affected,
            ..Default::default()
        });
    }

    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i)?));
        }
        rows.push(values);
    }
    Ok(QueryResult {
        columns,
        rows,
        rows_affected: 0,
    })
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => i.into(),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned().into(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_blocks_destructive_in_production() {
        for q in [
            "DROP TABLE users",
            "drop table users;",
            "TRUNCATE logs",
            "DELETE FROM users WHERE id = 1",
            "update users set name = 'x'",
            "SELECT 1; DROP TABLE users",
            "WITH x AS (SELECT 1) DELETE FROM users",
        ] {
            let err = screen_query(q, true).unwrap_err();
            assert!(matches!(err, Error::DestructiveOperationBlocked { .. }), "{}", q);
        }
    }

    #[test]
    fn test_screen_ignores_literals_and_comments() {
        assert!(screen_query("SELECT 'drop table users' AS note", true).is_ok());
        assert!(screen_query("SELECT updated_at FROM posts -- delete later", true).is_ok());
        assert!(screen_query("SELECT /* DROP */ id FROM \"update\"", true).is_ok());
    }

    #[test]
    fn test_screen_allows_everything_outside_production() {
        assert!(screen_query("DROP TABLE users", false).is_ok());
        assert!(screen_query("  ", false).is_err());
    }

    #[tokio::test]
    async fn test_query_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("app.db"));
        db.query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL)")
            .await
            .unwrap();
        let inserted = db
            .query("INSERT INTO users (name, score) VALUES ('ada', 1.5)")
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected, 1);

        let result = db.query("SELECT id, name, score FROM users").await.unwrap();
        assert_eq!(result.columns, vec!["id", "name", "score"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][1], serde_json::json!("ada"));
        assert_eq!(result.rows[0][2], serde_json::json!(1.5));
    }

    #[tokio::test]
    async fn test_multi_statement_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("app.db"));
        let result = db
            .query("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);")
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 2);
    }

    #[tokio::test]
    async fn test_semicolons_in_literals_and_comments() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("app.db"));

        let result = db.query("SELECT ';' AS sep").await.unwrap();
        assert_eq!(result.columns, vec!["sep"]);
        assert_eq!(result.rows, vec![vec![serde_json::json!(";")]]);

        let result = db.query("SELECT 1 AS one; -- trailing note").await.unwrap();
        assert_eq!(result.rows, vec![vec![serde_json::json!(1)]]);

        let result = db.query("SELECT 'a;b' AS v /* ; */;").await.unwrap();
        assert_eq!(result.rows, vec![vec![serde_json::json!("a;b")]]);

        assert!(matches!(db.query("-- nothing here").await, Err(Error::Validation(_))));
    }

    #[test]
    fn test_statements_split_on_real_separators() {
        assert_eq!(statements("SELECT ';'"), vec!["SELECT ';'"]);
        assert_eq!(statements("SELECT 1; -- x"), vec!["SELECT 1"]);
        assert_eq!(statements("SELECT 1;; SELECT 2;"), vec!["SELECT 1", "SELECT 2"]);
        assert!(statements("  ; -- only a comment").is_empty());
    }

    #[tokio::test]
    async fn test_slow_query_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("app.db")).with_timeout(Duration::from_millis(1));
        let err = db
            .query(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 1000000) \
                 SELECT count(*) FROM c",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
