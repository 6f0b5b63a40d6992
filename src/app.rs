use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::biom::BiomOptions;
use crate::config::ResolvedConfig;
use crate::error::OtuError;
use crate::export::{biom_archive_name, biom_stream_size, local_now, make_timestamp, save_biom_zip_file};
use crate::filter::OtuQueryParams;
use crate::ontology::OntologyInfo;
use crate::query::{
    ImportMetadata, ImportedFile, MetadataInfo, QueryContext, SampleQuery, SortSpec,
    get_sample_ids,
};
use crate::request::QueryRequest;
use crate::schema::{FieldValue, Otu};
use crate::taxonomy::{TaxonomyChoices, TaxonomyOptions};

#[derive(Debug, Clone, Serialize)]
pub struct DescribeResult {
    pub summary: String,
    pub description: String,
    pub filename: String,
    pub generation: String,
    pub metadata: ImportMetadata,
    pub imported_files: Vec<ImportedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionsResult {
    #[serde(flatten)]
    pub choices: Option<TaxonomyChoices>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SamplesResult {
    pub total_samples: usize,
    pub matching: usize,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtusResult {
    pub kingdom_id: Option<i64>,
    pub has_abundance: bool,
    pub otus: Vec<Otu>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub path: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    pub filename: String,
    pub summary: String,
    pub bytes: u64,
}

pub struct App {
    config: ResolvedConfig,
    ctx: QueryContext,
}

impl App {
    pub fn new(config: ResolvedConfig) -> Result<Self, OtuError> {
        let cache = config.cache.build();
        let ctx = QueryContext::load(config.database.clone(), cache, config.schema.clone())?;
        Ok(Self { config, ctx })
    }

    pub fn with_context(config: ResolvedConfig, ctx: QueryContext) -> Self {
        Self { config, ctx }
    }

    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    pub fn params(&self, request: QueryRequest) -> Result<OtuQueryParams, OtuError> {
        let info = OntologyInfo::new(self.ctx.database())?;
        request.into_params(self.ctx.schema(), &info)
    }

    pub fn describe(&self, params: &OtuQueryParams) -> Result<DescribeResult, OtuError> {
        let info = OntologyInfo::new(self.ctx.database())?;
        let metadata_info = MetadataInfo::new(self.ctx.database())?;
        let metadata = metadata_info.import_metadata()?;
        let timestamp = make_timestamp(local_now());
        Ok(DescribeResult {
            summary: params.summary(&info)?,
            description: params.describe(&info, &metadata)?,
            filename: params.filename(&timestamp, ".biom.zip"),
            generation: self.ctx.generation().to_string(),
            metadata,
            imported_files: metadata_info.file_logs()?,
        })
    }

    pub fn options(
        &self,
        params: &OtuQueryParams,
        force_cache: bool,
    ) -> Result<OptionsResult, OtuError> {
        let options = TaxonomyOptions::new(&self.ctx)?;
        Ok(OptionsResult {
            choices: options.possibilities(&params.taxonomy_filter, force_cache)?,
        })
    }

    pub fn samples(
        &self,
        params: &OtuQueryParams,
        headers: &[String],
        sorting: &[SortSpec],
    ) -> Result<SamplesResult, OtuError> {
        let query = SampleQuery::new(&self.ctx, params)?;
        let headers: Vec<&str> = if headers.is_empty() {
            self.ctx
                .schema()
                .fields()
                .iter()
                .map(|field| field.name.as_str())
                .collect()
        } else {
            headers.iter().map(String::as_str).collect()
        };
        let rows = query.matching_sample_headers(&headers, sorting)?;

        let mut names = vec!["id".to_string(), "environment_id".to_string()];
        names.extend(headers.iter().map(|header| header.to_string()));
        Ok(SamplesResult {
            total_samples: get_sample_ids(self.ctx.database())?.len(),
            matching: rows.len(),
            headers: names,
            rows: rows
                .iter()
                .map(|row| row.iter().map(field_json).collect())
                .collect(),
        })
    }

    pub fn otus(
        &self,
        params: &OtuQueryParams,
        kingdom_id: Option<i64>,
    ) -> Result<OtusResult, OtuError> {
        let query = SampleQuery::new(&self.ctx, params)?;
        Ok(OtusResult {
            kingdom_id,
            has_abundance: query.has_matching_sample_otus(kingdom_id)?,
            otus: query.matching_otus(kingdom_id)?,
        })
    }

    pub fn export(
        &self,
        params: &OtuQueryParams,
        dir: Option<Utf8PathBuf>,
    ) -> Result<ExportResult, OtuError> {
        let dir = dir.unwrap_or_else(|| self.config.export_dir.clone());
        let query = SampleQuery::new(&self.ctx, params)?;
        let path = save_biom_zip_file(&query, &dir, &self.biom_options())?;
        Ok(ExportResult { path })
    }

    pub fn bench(&self, params: &OtuQueryParams) -> Result<BenchResult, OtuError> {
        let info = OntologyInfo::new(self.ctx.database())?;
        let options = self.biom_options();
        let query = SampleQuery::new(&self.ctx, params)?;
        Ok(BenchResult {
            filename: biom_archive_name(&make_timestamp(options.date)),
            summary: params.summary(&info)?,
            bytes: biom_stream_size(&query, &options)?,
        })
    }

    fn biom_options(&self) -> BiomOptions {
        BiomOptions {
            generated_by: self.config.generated_by.clone(),
            otu_chunk_size: self.config.otu_chunk_size,
            abundance_chunk_size: self.config.abundance_chunk_size,
            date: local_now(),
        }
    }
}

fn field_json(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::Null => JsonValue::Null,
        FieldValue::Integer(value) => JsonValue::from(*value),
        FieldValue::Float(value) => JsonValue::from(*value),
        FieldValue::Date(value) => JsonValue::from(value.to_string()),
        FieldValue::Text(value) => JsonValue::from(value.as_str()),
    }
}
