use rusqlite::Connection;

use crate::db::Database;
use crate::error::{OtuError, db_error};

pub struct OntologyInfo {
    session: Connection,
}

impl OntologyInfo {
    pub fn new(database: &Database) -> Result<Self, OtuError> {
        Ok(Self {
            session: database.session()?,
        })
    }

    pub fn from_session(session: Connection) -> Self {
        Self { session }
    }

    pub fn get_values(&self, table: &str) -> Result<Vec<(i64, String)>, OtuError> {
        let sql = format!("SELECT id, value FROM {table} ORDER BY value, id");
        let mut stmt = self.session.prepare(&sql).map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }

    pub fn id_to_value(&self, table: &str, id: Option<i64>) -> Result<Option<String>, OtuError> {
        let Some(id) = id else {
            return Ok(None);
        };
        let sql = format!("SELECT value FROM {table} WHERE id = ?1");
        self.exactly_one(&sql, rusqlite::types::Value::Integer(id), table, &id.to_string())
            .map(Some)
    }

    pub fn value_to_id(&self, table: &str, value: Option<&str>) -> Result<Option<i64>, OtuError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let sql = format!("SELECT id FROM {table} WHERE value = ?1");
        self.exactly_one(
            &sql,
            rusqlite::types::Value::Text(value.to_string()),
            table,
            value,
        )
        .map(Some)
    }

    fn exactly_one<T: rusqlite::types::FromSql>(
        &self,
        sql: &str,
        param: rusqlite::types::Value,
        table: &str,
        key: &str,
    ) -> Result<T, OtuError> {
        let mut stmt = self.session.prepare(sql).map_err(db_error)?;
        let mut rows = stmt.query([param]).map_err(db_error)?;
        let first = rows
            .next()
            .map_err(db_error)?
            .map(|row| row.get::<_, T>(0))
            .transpose()
            .map_err(db_error)?;
        let Some(first) = first else {
            return Err(OtuError::OntologyNotFound {
                table: table.to_string(),
                key: key.to_string(),
            });
        };
        if rows.next().map_err(db_error)?.is_some() {
            return Err(OtuError::OntologyNotFound {
                table: table.to_string(),
                key: format!("{key} (multiple matches)"),
            });
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn info() -> OntologyInfo {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE otu_kingdom (id INTEGER PRIMARY KEY, value TEXT);
             INSERT INTO otu_kingdom VALUES (1, 'Bacteria'), (2, 'Archaea');",
        )
        .unwrap();
        OntologyInfo::from_session(conn)
    }

    #[test]
    fn values_are_sorted_by_display_value() {
        let values = info().get_values("otu_kingdom").unwrap();
        assert_eq!(
            values,
            vec![(2, "Archaea".to_string()), (1, "Bacteria".to_string())]
        );
    }

    #[test]
    fn lookups_round_trip() {
        let info = info();
        assert_eq!(
            info.id_to_value("otu_kingdom", Some(1)).unwrap().as_deref(),
            Some("Bacteria")
        );
        assert_eq!(info.value_to_id("otu_kingdom", Some("Archaea")).unwrap(), Some(2));
        assert_eq!(info.id_to_value("otu_kingdom", None).unwrap(), None);
    }

    #[test]
    fn missing_entries_are_errors() {
        let info = info();
        assert_matches!(
            info.id_to_value("otu_kingdom", Some(99)),
            Err(OtuError::OntologyNotFound { .. })
        );
        assert_matches!(
            info.value_to_id("otu_kingdom", Some("Fungi")),
            Err(OtuError::OntologyNotFound { .. })
        );
    }
}
