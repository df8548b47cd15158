//! SQLite driver.
//!
//! One table holds every resource kind. Each row is the record's fields as a
//! JSON document keyed by `(kind, id)`; filters compile to `json_extract`
//! comparisons.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::{Map, Value};
use std::path::Path;

use super::{CmpOp, Condition, Driver, DriverError, DriverResult, Filter};
use crate::vfs::{Record, ResourceId, ResourceKind, SchemaDoc};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at INTEGER DEFAULT (unixepoch()),
    PRIMARY KEY (kind, id)
);
CREATE INDEX IF NOT EXISTS idx_resources_kind ON resources(kind);
"#;

/// Backend over a single SQLite database.
pub struct SqliteDriver {
    conn: Mutex<Connection>,
}

impl SqliteDriver {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> DriverResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> DriverResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn decode(kind: ResourceKind, id: String, body: &str) -> DriverResult<Record> {
        let fields: Map<String, Value> = serde_json::from_str(body)?;
        Ok(Record {
            kind,
            id: ResourceId::new(id),
            synthetic: false,
            fields,
        })
    }

    fn select(&self, kind: ResourceKind, filter: &Filter) -> DriverResult<Vec<Record>> {
        let mut sql = String::from("SELECT id, body FROM resources WHERE kind = ?");
        let mut binds: Vec<SqlValue> = vec![SqlValue::Text(kind.to_string())];
        for condition in &filter.conditions {
            let (clause, values) = compile(condition)?;
            sql.push_str(" AND ");
            sql.push_str(&clause);
            binds.extend(values);
        }
        sql.push_str(" ORDER BY id");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, body) = row?;
            records.push(Self::decode(kind, id, &body)?);
        }
        Ok(records)
    }
}

/// Compile one condition into a SQL fragment and its bind values.
///
/// Mirrors [`Condition::matches`]: numbers compare numerically against JSON
/// numbers and numeric text, strings compare as text (and numerically too
/// when they parse as a number), booleans only against booleans. A value
/// of the wrong type never matches, except under `!=` where any present
/// value that is not equal does.
fn compile(condition: &Condition) -> DriverResult<(String, Vec<SqlValue>)> {
    let field = &condition.field;
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DriverError::query(format!("invalid field name {field:?}")));
    }
    let (column, json_type) = if field == "id" {
        ("id".to_string(), "'text'".to_string())
    } else {
        (
            format!("json_extract(body, '$.{field}')"),
            format!("json_type(body, '$.{field}')"),
        )
    };
    let numeric = format!(
        "({json_type} IN ('integer', 'real') OR ({json_type} = 'text' AND {}))",
        numeric_text(&column)
    );
    let text = format!("{json_type} = 'text'");

    let (op, negate) = match condition.op {
        CmpOp::Ne => (CmpOp::Eq.sql(), true),
        op => (op.sql(), false),
    };
    let (clause, binds) = match &condition.value {
        Value::Number(n) => {
            let n = n
                .as_f64()
                .ok_or_else(|| DriverError::query(format!("unrepresentable number {n}")))?;
            Ok((
                format!("({numeric} AND CAST({column} AS REAL) {op} ?)"),
                vec![SqlValue::Real(n)],
            ))
        }
        Value::String(s) => match s.parse::<f64>() {
            Ok(n) => Ok((
                format!(
                    "(({text} AND {column} {op} ?) OR ({json_type} IN ('integer', 'real') AND CAST({column} AS REAL) {op} ?))"
                ),
                vec![SqlValue::Text(s.clone()), SqlValue::Real(n)],
            )),
            Err(_) => Ok((
                format!("({text} AND {column} {op} ?)"),
                vec![SqlValue::Text(s.clone())],
            )),
        },
        Value::Bool(b) => Ok((
            format!("({json_type} IN ('true', 'false') AND {column} {op} ?)"),
            vec![SqlValue::Integer(i64::from(*b))],
        )),
        other => Err(DriverError::query(format!(
            "cannot filter {field} on {other}"
        ))),
    }?;

    if negate {
        Ok((format!("({json_type} IS NOT NULL AND NOT {clause})"), binds))
    } else {
        Ok((clause, binds))
    }
}

/// Text made only of number characters with at least one digit.
fn numeric_text(column: &str) -> String {
    format!("({column} GLOB '*[0-9]*' AND {column} NOT GLOB '*[^0-9.eE+-]*')")
}

#[async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_by_id(&self, kind: ResourceKind, id: &ResourceId) -> DriverResult<Option<Record>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM resources WHERE kind = ?1 AND id = ?2",
                params![kind.to_string(), id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| Self::decode(kind, id.to_string(), &b))
            .transpose()
    }

    async fn query(&self, kind: ResourceKind, filter: &Filter) -> DriverResult<Vec<Record>> {
        self.select(kind, filter)
    }

    async fn list(&self, kind: ResourceKind) -> DriverResult<Vec<Record>> {
        self.select(kind, &Filter::all())
    }

    async fn put(&self, record: &Record) -> DriverResult<Record> {
        let body = serde_json::to_string(&record.fields)?;
        self.conn.lock().execute(
            "INSERT INTO resources (kind, id, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind, id) DO UPDATE SET body = excluded.body, updated_at = unixepoch()",
            params![record.kind.to_string(), record.id.as_str(), body],
        )?;
        Ok(record.clone())
    }

    async fn describe(&self, kind: ResourceKind) -> DriverResult<SchemaDoc> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT j.key FROM resources r, json_each(r.body) j
             WHERE r.kind = ?1 ORDER BY j.key",
        )?;
        let keys = stmt
            .query_map(params![kind.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        if keys.is_empty() {
            let rows: i64 = conn.query_row(
                "SELECT COUNT(*) FROM resources WHERE kind = ?1",
                params![kind.to_string()],
                |row| row.get(0),
            )?;
            if rows == 0 {
                return Err(DriverError::NotFound(format!("no {kind} rows to describe")));
            }
        }

        let mut fields = vec!["id".to_string()];
        fields.extend(keys.into_iter().filter(|k| k != "id"));
        fields.sort();
        Ok(SchemaDoc { kind, fields })
    }

    async fn probe(&self) -> DriverResult<()> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> SqliteDriver {
        let db = SqliteDriver::in_memory().unwrap();
        for (id, level, entity) in [("1", 1, "3"), ("2", 5, "3"), ("3", 9, "4")] {
            db.put(
                &Record::new(ResourceKind::Effect, id)
                    .with_field("level", level)
                    .with_field("entity_id", entity),
            )
            .await
            .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let db = seeded().await;
        let got = db.get_by_id(ResourceKind::Effect, &"2".into()).await.unwrap().unwrap();
        assert_eq!(got.get("level"), Some(&json!(5)));
        assert!(db.get_by_id(ResourceKind::Effect, &"99".into()).await.unwrap().is_none());
        assert!(db.get_by_id(ResourceKind::Feat, &"2".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let db = seeded().await;
        db.put(&Record::new(ResourceKind::Effect, "1").with_field("level", 20))
            .await
            .unwrap();
        let got = db.get_by_id(ResourceKind::Effect, &"1".into()).await.unwrap().unwrap();
        assert_eq!(got.get("level"), Some(&json!(20)));
        assert!(got.get("entity_id").is_none());
        assert_eq!(db.list(ResourceKind::Effect).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let db = seeded().await;
        let low = db
            .query(ResourceKind::Effect, &Filter::all().with("level", CmpOp::Le, 5))
            .await
            .unwrap();
        assert_eq!(low.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);

        // Numeric filter against a string column value.
        let owned = db
            .query(ResourceKind::Effect, &Filter::all().with("entity_id", CmpOp::Eq, 3))
            .await
            .unwrap();
        assert_eq!(owned.len(), 2);

        let by_id = db
            .query(ResourceKind::Effect, &Filter::by_id(&ResourceId::from(3)))
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
    }

    #[tokio::test]
    async fn test_query_agrees_with_in_memory_matching() {
        use crate::capability::MemoryDriver;

        let records = [
            Record::new(ResourceKind::Feat, "1").with_field("level", 3),
            Record::new(ResourceKind::Feat, "2").with_field("level", "4"),
            Record::new(ResourceKind::Feat, "3").with_field("level", "abc"),
            Record::new(ResourceKind::Feat, "4").with_field("level", 9),
            Record::new(ResourceKind::Feat, "5").with_field("level", true),
            Record::new(ResourceKind::Feat, "6").with_field("note", "a<b"),
        ];
        let db = SqliteDriver::in_memory().unwrap();
        for record in &records {
            db.put(record).await.unwrap();
        }
        let memory = MemoryDriver::with_records(records);

        let filters = [
            Filter::all().with("level", CmpOp::Le, 5),
            Filter::all().with("level", CmpOp::Ge, "4"),
            Filter::all().with("level", CmpOp::Eq, "abc"),
            Filter::all().with("level", CmpOp::Eq, true),
            Filter::all().with("level", CmpOp::Ne, 3),
            Filter::all().with("note", CmpOp::Eq, "a<b"),
        ];
        for filter in &filters {
            let ids = |rs: Vec<Record>| rs.into_iter().map(|r| r.id.to_string()).collect::<Vec<_>>();
            let sql = ids(db.query(ResourceKind::Feat, filter).await.unwrap());
            let mem = ids(memory.query(ResourceKind::Feat, filter).await.unwrap());
            assert_eq!(sql, mem, "{filter:?}");
        }

        let low = db
            .query(ResourceKind::Feat, &Filter::all().with("level", CmpOp::Le, 5))
            .await
            .unwrap();
        assert_eq!(low.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_query_rejects_bad_field() {
        let db = seeded().await;
        let err = db
            .query(ResourceKind::Effect, &Filter::all().with("x'); DROP", CmpOp::Eq, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Query(_)));
    }

    #[tokio::test]
    async fn test_describe() {
        let db = seeded().await;
        let doc = db.describe(ResourceKind::Effect).await.unwrap();
        assert_eq!(doc.fields, vec!["entity_id", "id", "level"]);
        assert!(db.describe(ResourceKind::Skill).await.is_err());
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grimoire.db");
        {
            let db = SqliteDriver::open(&path).unwrap();
            db.put(&Record::new(ResourceKind::Skill, "acrobatics").with_field("ability", "dex"))
                .await
                .unwrap();
        }
        let db = SqliteDriver::open(&path).unwrap();
        assert!(db.probe().await.is_ok());
        assert!(db.get_by_id(ResourceKind::Skill, &"acrobatics".into()).await.unwrap().is_some());
    }
}
