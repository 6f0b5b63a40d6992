use std::collections::VecDeque;
use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, Row, params_from_iter};
use tracing::debug;

use crate::error::{OtuError, db_error};

#[derive(Debug, Clone)]
pub struct Database {
    path: Utf8PathBuf,
}

impl Database {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn session(&self) -> Result<Connection, OtuError> {
        Connection::open_with_flags(
            self.path.as_std_path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| OtuError::Database(format!("open {}: {err}", self.path)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Condition {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::new(format!("{column} = ?"), vec![value.into()])
    }

    pub fn ne(column: &str, value: impl Into<Value>) -> Self {
        Self::new(format!("{column} != ?"), vec![value.into()])
    }

    pub fn always_false() -> Self {
        Self::new("0", Vec::new())
    }

    pub fn not(self) -> Self {
        Self::new(format!("COALESCE(({}), 0) = 0", self.sql), self.params)
    }

    pub fn in_subquery(column: &str, subquery: Compiled) -> Self {
        Self::new(format!("{column} IN ({})", subquery.sql), subquery.params)
    }

    pub fn all(conditions: Vec<Condition>) -> Option<Self> {
        Self::join(conditions, " AND ")
    }

    pub fn any(conditions: Vec<Condition>) -> Option<Self> {
        Self::join(conditions, " OR ")
    }

    fn join(conditions: Vec<Condition>, op: &str) -> Option<Self> {
        match conditions.len() {
            0 => None,
            1 => conditions.into_iter().next(),
            _ => {
                let mut sql = String::new();
                let mut params = Vec::new();
                for (idx, condition) in conditions.into_iter().enumerate() {
                    if idx > 0 {
                        sql.push_str(op);
                    }
                    let _ = write!(sql, "({})", condition.sql);
                    params.extend(condition.params);
                }
                Some(Self::new(sql, params))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct SelectBuilder {
    distinct: bool,
    columns: Vec<String>,
    from: String,
    joins: Vec<String>,
    conditions: Vec<Condition>,
    group_by: Vec<String>,
    order_by: Vec<(String, Direction)>,
    limit: Option<usize>,
}

impl SelectBuilder {
    pub fn new<I, S>(columns: I, from: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            from: from.to_string(),
            ..Self::default()
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn join(mut self, clause: impl Into<String>) -> Self {
        self.joins.push(clause.into());
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn filter_opt(self, condition: Option<Condition>) -> Self {
        match condition {
            Some(condition) => self.filter(condition),
            None => self,
        }
    }

    pub fn filter_all(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    pub fn group_by(mut self, expr: impl Into<String>) -> Self {
        self.group_by.push(expr.into());
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push((expr.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn compile(&self) -> Compiled {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&self.columns.join(", "));
        let _ = write!(sql, " FROM {}", self.from);
        for join in &self.joins {
            let _ = write!(sql, " {join}");
        }
        let mut params = Vec::new();
        if !self.conditions.is_empty() {
            let clauses: Vec<String> = self
                .conditions
                .iter()
                .map(|condition| format!("({})", condition.sql))
                .collect();
            let _ = write!(sql, " WHERE {}", clauses.join(" AND "));
            for condition in &self.conditions {
                params.extend(condition.params.iter().cloned());
            }
        }
        if !self.group_by.is_empty() {
            let _ = write!(sql, " GROUP BY {}", self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|(expr, direction)| match direction {
                    Direction::Asc => expr.clone(),
                    Direction::Desc => format!("{expr} DESC"),
                })
                .collect();
            let _ = write!(sql, " ORDER BY {}", terms.join(", "));
        }
        if let Some(limit) = self.limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        Compiled { sql, params }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Compiled {
    pub fn exists(self) -> Compiled {
        Compiled {
            sql: format!("SELECT EXISTS ({})", self.sql),
            params: self.params,
        }
    }

    pub fn params_repr(&self) -> String {
        let parts: Vec<String> = self.params.iter().map(value_repr).collect();
        format!("[{}]", parts.join(", "))
    }

    pub fn query_all<T, F>(&self, conn: &Connection, mut map: F) -> Result<Vec<T>, OtuError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        debug!(sql = %self.sql, params = %self.params_repr(), "query");
        let mut stmt = conn.prepare_cached(&self.sql).map_err(db_error)?;
        let rows = stmt
            .query_map(params_from_iter(self.params.iter()), |row| map(row))
            .map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }

    pub fn query_bool(&self, conn: &Connection) -> Result<bool, OtuError> {
        debug!(sql = %self.sql, params = %self.params_repr(), "query");
        conn.query_row(&self.sql, params_from_iter(self.params.iter()), |row| {
            row.get::<_, bool>(0)
        })
        .map_err(db_error)
    }
}

pub fn value_repr(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Integer(value) => value.to_string(),
        Value::Real(value) => format!("{value:?}"),
        Value::Text(value) => format!("{value:?}"),
        Value::Blob(value) => format!("b{}", hex::encode(value)),
    }
}

/// Forward-only, chunked iteration over a query ordered by a unique key.
///
/// Each page is fetched with a keyset predicate (`key > last`) and a limit, so
/// at most `chunk_size` rows are held at a time and no statement stays open
/// between pages.
pub struct Paged<'c, T> {
    conn: &'c Connection,
    base: SelectBuilder,
    key_columns: Vec<String>,
    chunk_size: usize,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
    key_of: fn(&T) -> Vec<Value>,
    last_key: Option<Vec<Value>>,
    buffer: VecDeque<T>,
    exhausted: bool,
}

impl<'c, T> Paged<'c, T> {
    pub fn new(
        conn: &'c Connection,
        base: SelectBuilder,
        key_columns: &[&str],
        chunk_size: usize,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
        key_of: fn(&T) -> Vec<Value>,
    ) -> Self {
        Self {
            conn,
            base,
            key_columns: key_columns.iter().map(|col| col.to_string()).collect(),
            chunk_size: chunk_size.max(1),
            map,
            key_of,
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn page_query(&self) -> Compiled {
        let mut builder = self.base.clone();
        if let Some(last) = &self.last_key {
            let placeholders = vec!["?"; last.len()].join(", ");
            let condition = if self.key_columns.len() == 1 {
                format!("{} > ?", self.key_columns[0])
            } else {
                format!("({}) > ({placeholders})", self.key_columns.join(", "))
            };
            builder = builder.filter(Condition::new(condition, last.clone()));
        }
        for column in &self.key_columns {
            builder = builder.order_by(column.clone(), Direction::Asc);
        }
        builder.limit(self.chunk_size).compile()
    }

    fn fetch_page(&mut self) -> Result<(), OtuError> {
        let page = self.page_query().query_all(self.conn, self.map)?;
        if page.len() < self.chunk_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_key = Some((self.key_of)(last));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<T> Iterator for Paged<'_, T> {
    type Item = Result<T, OtuError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combines_conditions_with_parameters_in_order() {
        let combined = Condition::any(vec![
            Condition::eq("a", 1_i64),
            Condition::new("b BETWEEN ? AND ?", vec![Value::Real(1.0), Value::Real(2.0)]),
        ])
        .unwrap();
        assert_eq!(combined.sql, "(a = ?) OR (b BETWEEN ? AND ?)");
        assert_eq!(combined.params.len(), 3);
        assert!(Condition::all(Vec::new()).is_none());
        assert_eq!(
            Condition::all(vec![Condition::eq("a", 1_i64)]).unwrap().sql,
            "a = ?"
        );
    }

    #[test]
    fn negation_treats_unknown_as_false() {
        let negated = Condition::eq("a", 1_i64).not();
        assert_eq!(negated.sql, "COALESCE((a = ?), 0) = 0");
    }

    #[test]
    fn compiles_select_with_clauses() {
        let compiled = SelectBuilder::new(["otu.id"], "otu")
            .distinct()
            .join("JOIN sample_otu ON sample_otu.otu_id = otu.id")
            .filter(Condition::eq("otu.kingdom_id", 3_i64))
            .filter(Condition::ne("otu.amplicon_id", 1_i64))
            .order_by("otu.id", Direction::Desc)
            .limit(10)
            .compile();
        assert_eq!(
            compiled.sql,
            "SELECT DISTINCT otu.id FROM otu JOIN sample_otu ON sample_otu.otu_id = otu.id \
             WHERE (otu.kingdom_id = ?) AND (otu.amplicon_id != ?) ORDER BY otu.id DESC LIMIT 10"
        );
        assert_eq!(compiled.params_repr(), "[3, 1]");
    }

    #[test]
    fn pages_through_all_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (a INTEGER, b INTEGER);
             INSERT INTO t VALUES (1, 1), (1, 2), (2, 1), (3, 5), (3, 6);",
        )
        .unwrap();
        let paged: Paged<'_, (i64, i64)> = Paged::new(
            &conn,
            SelectBuilder::new(["t.a", "t.b"], "t"),
            &["t.a", "t.b"],
            2,
            |row| Ok((row.get(0)?, row.get(1)?)),
            |(a, b)| vec![Value::Integer(*a), Value::Integer(*b)],
        );
        let rows: Vec<_> = paged.collect::<Result<_, _>>().unwrap();
        assert_eq!(rows, vec![(1, 1), (1, 2), (2, 1), (3, 5), (3, 6)]);
    }
}
