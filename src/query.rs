use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::types::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CACHE_7DAYS, CacheRepr, DatasetGeneration, ResultCache};
use crate::db::{Compiled, Condition, Database, Direction, Paged, SelectBuilder};
use crate::error::{OtuError, db_error};
use crate::filter::{ContextualFilter, OtuQueryParams, TaxonomyFilter};
use crate::schema::{
    AMPLICON_COLUMN, AMPLICON_TABLE, ENVIRONMENT_COLUMN, FieldKind, FieldValue,
    IMPORT_METADATA_TABLE, IMPORTED_FILE_TABLE, OTU_TABLE, Otu, SAMPLE_OTU_TABLE, SAMPLE_TABLE,
    SampleContext, SampleOtu, SampleSchema, TaxonomyLevel,
};

#[derive(Clone)]
pub struct QueryContext {
    database: Database,
    cache: Arc<dyn ResultCache>,
    generation: DatasetGeneration,
    schema: Arc<SampleSchema>,
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("database", &self.database)
            .field("generation", &self.generation)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl QueryContext {
    pub fn load(
        database: Database,
        cache: Arc<dyn ResultCache>,
        schema: SampleSchema,
    ) -> Result<Self, OtuError> {
        let generation = MetadataInfo::new(&database)?.generation()?;
        debug!(generation = %generation, "loaded dataset generation");
        Ok(Self::with_generation(database, cache, schema, generation))
    }

    pub fn with_generation(
        database: Database,
        cache: Arc<dyn ResultCache>,
        schema: SampleSchema,
        generation: DatasetGeneration,
    ) -> Self {
        Self {
            database,
            cache,
            generation,
            schema: Arc::new(schema),
        }
    }

    pub fn refresh_generation(&mut self) -> Result<(), OtuError> {
        self.generation = MetadataInfo::new(&self.database)?.generation()?;
        Ok(())
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn cache(&self) -> &dyn ResultCache {
        self.cache.as_ref()
    }

    pub fn generation(&self) -> &DatasetGeneration {
        &self.generation
    }

    pub fn schema(&self) -> &SampleSchema {
        &self.schema
    }

    pub(crate) fn cached<T, F>(&self, key: &str, ttl: Option<Duration>, compute: F) -> Result<T, OtuError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, OtuError>,
    {
        if let Some(hit) = self.cache.get(key) {
            match serde_json::from_str(&hit) {
                Ok(value) => {
                    debug!(key, "cache hit");
                    return Ok(value);
                }
                Err(err) => warn!(key, error = %err, "discarding unreadable cache entry"),
            }
        }
        debug!(key, "cache miss");
        let value = compute()?;
        match serde_json::to_string(&value) {
            Ok(encoded) => self.cache.set(key, &encoded, ttl),
            Err(err) => warn!(key, error = %err, "result not cacheable"),
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMetadata {
    pub uuid: String,
    pub methodology: String,
    pub revision_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedFile {
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub rows_imported: i64,
    pub rows_skipped: i64,
}

pub struct MetadataInfo {
    session: Connection,
}

impl MetadataInfo {
    pub fn new(database: &Database) -> Result<Self, OtuError> {
        Ok(Self {
            session: database.session()?,
        })
    }

    pub fn import_metadata(&self) -> Result<ImportMetadata, OtuError> {
        let sql = format!("SELECT uuid, methodology, revision_date FROM {IMPORT_METADATA_TABLE}");
        let rows = Compiled {
            sql,
            params: Vec::new(),
        }
        .query_all(&self.session, |row| {
            Ok(ImportMetadata {
                uuid: row.get(0)?,
                methodology: row.get(1)?,
                revision_date: row.get(2)?,
            })
        })?;
        let count = rows.len();
        let mut rows = rows.into_iter();
        match (rows.next(), count) {
            (Some(metadata), 1) => Ok(metadata),
            (_, count) => Err(OtuError::MissingMetadata(format!(
                "expected one row in {IMPORT_METADATA_TABLE}, found {count}"
            ))),
        }
    }

    pub fn generation(&self) -> Result<DatasetGeneration, OtuError> {
        Ok(DatasetGeneration::new(self.import_metadata()?.uuid))
    }

    pub fn file_logs(&self) -> Result<Vec<ImportedFile>, OtuError> {
        let sql = format!(
            "SELECT filename, file_type, file_size, rows_imported, rows_skipped \
             FROM {IMPORTED_FILE_TABLE} ORDER BY filename"
        );
        Compiled {
            sql,
            params: Vec::new(),
        }
        .query_all(&self.session, |row| {
            Ok(ImportedFile {
                filename: row.get(0)?,
                file_type: row.get(1)?,
                file_size: row.get(2)?,
                rows_imported: row.get(3)?,
                rows_skipped: row.get(4)?,
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub col_idx: usize,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtuDetail {
    pub id: i64,
    pub code: String,
    pub amplicon: Option<String>,
    pub taxonomy: [Option<String>; 7],
}

const OTU_COLUMNS: [&str; 10] = [
    "otu.id",
    "otu.code",
    "otu.amplicon_id",
    "otu.kingdom_id",
    "otu.phylum_id",
    "otu.class_id",
    "otu.order_id",
    "otu.family_id",
    "otu.genus_id",
    "otu.species_id",
];

fn read_otu(row: &rusqlite::Row<'_>) -> rusqlite::Result<Otu> {
    let mut taxonomy = [None; 7];
    for (idx, slot) in taxonomy.iter_mut().enumerate() {
        *slot = row.get(3 + idx)?;
    }
    Ok(Otu {
        id: row.get(0)?,
        code: row.get(1)?,
        amplicon_id: row.get(2)?,
        taxonomy,
    })
}

fn read_otu_detail(row: &rusqlite::Row<'_>) -> rusqlite::Result<OtuDetail> {
    let mut taxonomy: [Option<String>; 7] = Default::default();
    for (idx, slot) in taxonomy.iter_mut().enumerate() {
        *slot = row.get(3 + idx)?;
    }
    Ok(OtuDetail {
        id: row.get(0)?,
        code: row.get(1)?,
        amplicon: row.get(2)?,
        taxonomy,
    })
}

fn read_sample_otu(row: &rusqlite::Row<'_>) -> rusqlite::Result<SampleOtu> {
    Ok(SampleOtu {
        sample_id: row.get(0)?,
        otu_id: row.get(1)?,
        count: row.get(2)?,
    })
}

pub struct SampleQuery<'ctx> {
    ctx: &'ctx QueryContext,
    session: Connection,
    taxonomy_filter: TaxonomyFilter,
    contextual_filter: ContextualFilter,
}

impl<'ctx> SampleQuery<'ctx> {
    pub fn new(ctx: &'ctx QueryContext, params: &OtuQueryParams) -> Result<Self, OtuError> {
        Ok(Self {
            ctx,
            session: ctx.database().session()?,
            taxonomy_filter: params.taxonomy_filter.clone(),
            contextual_filter: params.contextual_filter.clone(),
        })
    }

    pub fn context(&self) -> &QueryContext {
        self.ctx
    }

    pub fn taxonomy_filter(&self) -> &TaxonomyFilter {
        &self.taxonomy_filter
    }

    pub fn contextual_filter(&self) -> &ContextualFilter {
        &self.contextual_filter
    }

    fn q_all_cached<T, F>(
        &self,
        topic: &str,
        compiled: &Compiled,
        read: F,
    ) -> Result<Vec<T>, OtuError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let key = self.query_key(topic, compiled);
        self.ctx.cached(&key, CACHE_7DAYS, || {
            compiled.query_all(&self.session, read)
        })
    }

    fn query_key(&self, topic: &str, compiled: &Compiled) -> String {
        self.ctx.generation().cache_key(&[
            &"SampleQuery.q_all_cached",
            &topic,
            &compiled.sql,
            &compiled.params_repr(),
        ])
    }

    pub fn matching_samples(&self) -> Result<Vec<SampleContext>, OtuError> {
        self.sample_contexts("matching_samples", None)
    }

    pub fn sampled_contexts(&self) -> Result<Vec<SampleContext>, OtuError> {
        let touched = Condition::in_subquery(
            &format!("{SAMPLE_TABLE}.id"),
            self.touched_by_facts("sample_otu.sample_id"),
        );
        self.sample_contexts("sampled_contexts", Some(touched))
    }

    fn sample_contexts(
        &self,
        topic: &str,
        extra: Option<Condition>,
    ) -> Result<Vec<SampleContext>, OtuError> {
        let fields = self.ctx.schema().fields().to_vec();
        let mut columns = vec![
            format!("{SAMPLE_TABLE}.id"),
            format!("{SAMPLE_TABLE}.{ENVIRONMENT_COLUMN}"),
        ];
        columns.extend(fields.iter().map(|field| field.column()));
        let builder = self
            .assemble_sample_query(SelectBuilder::new(columns, SAMPLE_TABLE))
            .filter_opt(extra)
            .order_by(format!("{SAMPLE_TABLE}.id"), Direction::Asc);
        self.q_all_cached(topic, &builder.compile(), |row| {
            let mut values = std::collections::BTreeMap::new();
            for (idx, field) in fields.iter().enumerate() {
                values.insert(field.name.clone(), FieldValue::read(row, 2 + idx, &field.kind)?);
            }
            Ok(SampleContext {
                id: row.get(0)?,
                environment_id: row.get(1)?,
                values,
            })
        })
    }

    pub fn sample_ids(&self) -> Result<Vec<i64>, OtuError> {
        let builder = self
            .assemble_sample_query(SelectBuilder::new([format!("{SAMPLE_TABLE}.id")], SAMPLE_TABLE))
            .order_by(format!("{SAMPLE_TABLE}.id"), Direction::Asc);
        self.q_all_cached("sample_ids", &builder.compile(), |row| row.get(0))
    }

    pub fn matching_sample_headers(
        &self,
        required_headers: &[&str],
        sorting: &[SortSpec],
    ) -> Result<Vec<Vec<FieldValue>>, OtuError> {
        let mut columns = vec![
            format!("{SAMPLE_TABLE}.id"),
            format!("{SAMPLE_TABLE}.{ENVIRONMENT_COLUMN}"),
        ];
        // id and environment id are both plain integer columns
        let mut kinds = vec![FieldKind::SampleId, FieldKind::SampleId];
        let mut joins = Vec::new();
        for header in required_headers.iter().filter(|header| !header.is_empty()) {
            let field = self.ctx.schema().field(header)?;
            match &field.kind {
                FieldKind::Ontology { table } => {
                    let alias = format!("h{}", joins.len());
                    columns.push(format!("{alias}.value"));
                    joins.push(format!(
                        "LEFT OUTER JOIN {table} AS {alias} ON {alias}.id = {}",
                        field.column()
                    ));
                    kinds.push(FieldKind::Text);
                }
                kind => {
                    columns.push(field.column());
                    kinds.push(kind.clone());
                }
            }
        }

        let mut builder = SelectBuilder::new(columns.clone(), SAMPLE_TABLE);
        for join in joins {
            builder = builder.join(join);
        }
        let mut builder = self.assemble_sample_query(builder);
        for sort in sorting {
            let column = columns.get(sort.col_idx).ok_or(OtuError::InvalidSort {
                index: sort.col_idx,
                columns: columns.len(),
            })?;
            let direction = if sort.desc {
                Direction::Desc
            } else {
                Direction::Asc
            };
            builder = builder.order_by(column.clone(), direction);
        }

        self.q_all_cached("matching_sample_headers", &builder.compile(), |row| {
            kinds
                .iter()
                .enumerate()
                .map(|(idx, kind)| FieldValue::read(row, idx, kind))
                .collect()
        })
    }

    pub fn matching_otus(&self, kingdom_id: Option<i64>) -> Result<Vec<Otu>, OtuError> {
        let builder = self
            .assemble_otu_query(SelectBuilder::new(OTU_COLUMNS, OTU_TABLE), kingdom_id)
            .order_by("otu.id", Direction::Asc);
        let topic = format!("matching_otus:{}", kingdom_id.cache_repr());
        self.q_all_cached(&topic, &builder.compile(), read_otu)
    }

    pub fn matching_otu_details(
        &self,
        kingdom_id: Option<i64>,
        chunk_size: usize,
    ) -> Paged<'_, OtuDetail> {
        self.otu_details(kingdom_id, chunk_size, None)
    }

    pub fn sampled_otu_details(&self, chunk_size: usize) -> Paged<'_, OtuDetail> {
        let touched =
            Condition::in_subquery("otu.id", self.touched_by_facts("sample_otu.otu_id"));
        self.otu_details(None, chunk_size, Some(touched))
    }

    fn otu_details(
        &self,
        kingdom_id: Option<i64>,
        chunk_size: usize,
        extra: Option<Condition>,
    ) -> Paged<'_, OtuDetail> {
        let mut columns = vec![
            "otu.id".to_string(),
            "otu.code".to_string(),
            "amplicon.value".to_string(),
        ];
        let mut builder_joins = vec![format!(
            "LEFT OUTER JOIN {AMPLICON_TABLE} AS amplicon ON amplicon.id = otu.{AMPLICON_COLUMN}"
        )];
        for level in TaxonomyLevel::ALL {
            let alias = format!("t_{}", level.name());
            columns.push(format!("{alias}.value"));
            builder_joins.push(format!(
                "LEFT OUTER JOIN {} AS {alias} ON {alias}.id = otu.{}",
                level.ontology_table(),
                level.column()
            ));
        }
        let mut builder = SelectBuilder::new(columns, OTU_TABLE);
        for join in builder_joins {
            builder = builder.join(join);
        }
        let builder = self.assemble_otu_query(builder, kingdom_id).filter_opt(extra);
        Paged::new(
            &self.session,
            builder,
            &["otu.id"],
            chunk_size,
            read_otu_detail,
            |otu| vec![Value::Integer(otu.id)],
        )
    }

    pub fn matching_sample_otus(
        &self,
        kingdom_id: Option<i64>,
        chunk_size: usize,
    ) -> Paged<'_, SampleOtu> {
        Paged::new(
            &self.session,
            self.sample_otu_query(kingdom_id),
            &["sample_otu.otu_id", "sample_otu.sample_id"],
            chunk_size,
            read_sample_otu,
            |fact| vec![Value::Integer(fact.otu_id), Value::Integer(fact.sample_id)],
        )
    }

    pub fn has_matching_sample_otus(&self, kingdom_id: Option<i64>) -> Result<bool, OtuError> {
        let compiled = self.sample_otu_query(kingdom_id).compile().exists();
        let topic = format!("has_matching_sample_otus:{}", kingdom_id.cache_repr());
        let key = self.query_key(&topic, &compiled);
        self.ctx
            .cached(&key, CACHE_7DAYS, || compiled.query_bool(&self.session))
    }

    fn sample_otu_query(&self, kingdom_id: Option<i64>) -> SelectBuilder {
        self.fact_query(
            [
                "sample_otu.sample_id",
                "sample_otu.otu_id",
                "sample_otu.count",
            ],
            kingdom_id,
        )
    }

    fn touched_by_facts(&self, column: &str) -> Compiled {
        self.fact_query([column], None).distinct().compile()
    }

    // cross join of otu, sample_otu and sample_context, narrowed to an inner
    // join by the key predicates, with both filters applied directly
    fn fact_query<I, S>(&self, columns: I, kingdom_id: Option<i64>) -> SelectBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SelectBuilder::new(
            columns,
            &format!("{OTU_TABLE}, {SAMPLE_OTU_TABLE}, {SAMPLE_TABLE}"),
        )
        .filter(Condition::new("otu.id = sample_otu.otu_id", Vec::new()))
        .filter(Condition::new(
            "sample_context.id = sample_otu.sample_id",
            Vec::new(),
        ))
        .filter_all(self.taxonomy_filter.conditions())
        .filter_all(self.contextual_filter.conditions())
        .filter_opt(kingdom_condition(kingdom_id))
    }

    fn build_taxonomy_subquery(&self) -> Option<Compiled> {
        if self.taxonomy_filter.is_empty() {
            return None;
        }
        let builder = SelectBuilder::new(["sample_otu.sample_id"], SAMPLE_OTU_TABLE)
            .distinct()
            .join("JOIN otu ON otu.id = sample_otu.otu_id")
            .filter_all(self.taxonomy_filter.conditions());
        Some(builder.compile())
    }

    fn build_contextual_subquery(&self) -> Option<Compiled> {
        if self.contextual_filter.is_empty() {
            return None;
        }
        let builder = SelectBuilder::new(["sample_otu.otu_id"], SAMPLE_OTU_TABLE)
            .distinct()
            .join("JOIN sample_context ON sample_context.id = sample_otu.sample_id")
            .filter_all(self.contextual_filter.conditions());
        Some(builder.compile())
    }

    fn assemble_sample_query(&self, builder: SelectBuilder) -> SelectBuilder {
        builder
            .filter_opt(
                self.build_taxonomy_subquery()
                    .map(|subquery| Condition::in_subquery("sample_context.id", subquery)),
            )
            .filter_all(self.contextual_filter.conditions())
    }

    fn assemble_otu_query(&self, builder: SelectBuilder, kingdom_id: Option<i64>) -> SelectBuilder {
        builder
            .filter_opt(
                self.build_contextual_subquery()
                    .map(|subquery| Condition::in_subquery("otu.id", subquery)),
            )
            .filter_all(self.taxonomy_filter.conditions())
            .filter_opt(kingdom_condition(kingdom_id))
    }
}

fn kingdom_condition(kingdom_id: Option<i64>) -> Option<Condition> {
    kingdom_id.map(|id| Condition::eq("otu.kingdom_id", id))
}

pub fn get_sample_ids(database: &Database) -> Result<Vec<i64>, OtuError> {
    let session = database.session()?;
    let mut stmt = session
        .prepare(&format!("SELECT id FROM {SAMPLE_TABLE} ORDER BY id"))
        .map_err(db_error)?;
    let rows = stmt.query_map([], |row| row.get(0)).map_err(db_error)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
}
