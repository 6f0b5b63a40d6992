use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::iter;
use std::rc::Rc;

use chrono::NaiveDateTime;

use crate::error::OtuError;
use crate::query::{OtuDetail, SampleQuery};
use crate::schema::{ENVIRONMENT_COLUMN, SampleContext, json_string};

pub type Fragment = Result<String, OtuError>;
pub type Fragments<'a> = Box<dyn Iterator<Item = Fragment> + 'a>;

pub const DEFAULT_OTU_CHUNK_SIZE: usize = 50;
pub const DEFAULT_ABUNDANCE_CHUNK_SIZE: usize = 5000;
pub const DEFAULT_GENERATED_BY: &str = "otu-query";

const SAMPLE_ID_PREFIX: &str = "102.100.100/";

#[derive(Debug, Clone, PartialEq)]
pub struct BiomOptions {
    pub generated_by: String,
    pub otu_chunk_size: usize,
    pub abundance_chunk_size: usize,
    pub date: NaiveDateTime,
}

impl BiomOptions {
    pub fn new(date: NaiveDateTime) -> Self {
        Self {
            generated_by: DEFAULT_GENERATED_BY.to_string(),
            otu_chunk_size: DEFAULT_OTU_CHUNK_SIZE,
            abundance_chunk_size: DEFAULT_ABUNDANCE_CHUNK_SIZE,
            date,
        }
    }
}

type IndexMap = Rc<RefCell<HashMap<i64, usize>>>;

/// The complete BIOM document for `query`.
///
/// Row and column indices are assigned while the `rows` and `columns`
/// sections are consumed; `shape` and `data` read those assignments, so the
/// fragments must be consumed in order.
pub fn generate_biom_file<'a>(query: &'a SampleQuery<'_>, options: &BiomOptions) -> Fragments<'a> {
    let otu_to_row: IndexMap = Rc::default();
    let sample_to_column: IndexMap = Rc::default();

    let rows = otu_rows(query, options.otu_chunk_size, Rc::clone(&otu_to_row));
    let columns = sample_columns(query, Rc::clone(&sample_to_column));
    let shape = shape(Rc::clone(&otu_to_row), Rc::clone(&sample_to_column));
    let data = abundance_table(
        query,
        options.abundance_chunk_size,
        otu_to_row,
        sample_to_column,
    );

    Box::new(
        iter::once(Ok(biom_header(options)))
            .chain(wrap("\"rows\": [", rows, "],\n"))
            .chain(wrap("\"columns\": [", columns, "],\n"))
            .chain(wrap("\"shape\": [", shape, "],\n"))
            .chain(wrap("\"data\": [", data, "]}\n")),
    )
}

fn biom_header(options: &BiomOptions) -> String {
    let date = options.date.format("%Y-%m-%dT%H:%M:%S").to_string();
    let fields = [
        key_value("id", "null"),
        key_value("format", &json_string("1.0.0")),
        key_value("format_url", &json_string("http://biom-format.org")),
        key_value("type", &json_string("OTU table")),
        key_value("generated_by", &json_string(&options.generated_by)),
        key_value("date", &json_string(&date)),
        key_value("matrix_type", &json_string("sparse")),
        key_value("matrix_element_type", &json_string("int")),
    ];
    format!("{{{},\n", fields.join(",\n"))
}

fn otu_rows<'a>(
    query: &'a SampleQuery<'_>,
    chunk_size: usize,
    otu_to_row: IndexMap,
) -> impl Iterator<Item = Fragment> + 'a {
    query
        .sampled_otu_details(chunk_size)
        .map(move |otu| {
            let otu = otu?;
            let mut rows = otu_to_row.borrow_mut();
            let idx = rows.len();
            rows.entry(otu.id).or_insert(idx);
            Ok(otu_row(&otu))
        })
}

fn otu_row(otu: &OtuDetail) -> String {
    let taxonomy: Vec<String> = otu
        .taxonomy
        .iter()
        .map(|value| json_string(value.as_deref().unwrap_or_default()))
        .collect();
    format!(
        "{{\"id\": {},\"metadata\": {{{},{}}}}}",
        json_string(&otu.code),
        key_value(
            "amplicon",
            &json_string(otu.amplicon.as_deref().unwrap_or_default())
        ),
        key_value("taxonomy", &format!("[{}]", taxonomy.join(", ")))
    )
}

fn sample_columns<'a>(query: &'a SampleQuery<'_>, sample_to_column: IndexMap) -> Fragments<'a> {
    deferred(move || {
        let samples = query.sampled_contexts()?;
        let fields = non_empty_fields(query, &samples);
        let columns = samples.into_iter().filter_map(move |sample| {
            let mut columns = sample_to_column.borrow_mut();
            if columns.contains_key(&sample.id) {
                return None;
            }
            let idx = columns.len();
            columns.insert(sample.id, idx);
            Some(Ok(sample_column(&sample, &fields)))
        });
        Ok(Box::new(columns) as Fragments<'a>)
    })
}

fn non_empty_fields(query: &SampleQuery<'_>, samples: &[SampleContext]) -> Vec<String> {
    let candidates = iter::once(ENVIRONMENT_COLUMN.to_string()).chain(
        query
            .context()
            .schema()
            .fields()
            .iter()
            .map(|field| field.name.clone()),
    );
    let present: BTreeSet<String> = candidates
        .filter(|field| {
            samples
                .iter()
                .any(|sample| !sample.value(field).non_empty().is_null())
        })
        .collect();
    present.into_iter().collect()
}

fn sample_column(sample: &SampleContext, fields: &[String]) -> String {
    let metadata: Vec<String> = fields
        .iter()
        .map(|field| key_value(field, &sample.value(field).non_empty().to_json()))
        .collect();
    format!(
        "{{\"id\": \"{SAMPLE_ID_PREFIX}{}\",\"metadata\": {{{}}}}}",
        sample.id,
        metadata.join(",")
    )
}

fn shape<'a>(otu_to_row: IndexMap, sample_to_column: IndexMap) -> Fragments<'a> {
    deferred(move || {
        let dims = [otu_to_row.borrow().len(), sample_to_column.borrow().len()];
        Ok(Box::new(dims.into_iter().map(|dim| Ok(dim.to_string()))) as Fragments<'a>)
    })
}

fn abundance_table<'a>(
    query: &'a SampleQuery<'_>,
    chunk_size: usize,
    otu_to_row: IndexMap,
    sample_to_column: IndexMap,
) -> impl Iterator<Item = Fragment> + 'a {
    query
        .matching_sample_otus(None, chunk_size)
        .map(move |fact| {
            let fact = fact?;
            let row = otu_to_row.borrow().get(&fact.otu_id).copied().ok_or_else(|| {
                OtuError::Export(format!("abundance for OTU {} has no row", fact.otu_id))
            })?;
            let column = sample_to_column
                .borrow()
                .get(&fact.sample_id)
                .copied()
                .ok_or_else(|| {
                    OtuError::Export(format!(
                        "abundance for sample {} has no column",
                        fact.sample_id
                    ))
                })?;
            Ok(format!("[{row},{column},{}]", fact.count))
        })
}

fn key_value(key: &str, json: &str) -> String {
    format!("{}:{json}", json_string(key))
}

pub struct Interpose<I> {
    inner: I,
    separator: &'static str,
    pending: Option<Fragment>,
    started: bool,
}

pub fn interpose<I>(fragments: I, separator: &'static str) -> Interpose<I>
where
    I: Iterator<Item = Fragment>,
{
    Interpose {
        inner: fragments,
        separator,
        pending: None,
        started: false,
    }
}

impl<I> Iterator for Interpose<I>
where
    I: Iterator<Item = Fragment>,
{
    type Item = Fragment;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(fragment) = self.pending.take() {
            return Some(fragment);
        }
        let fragment = self.inner.next()?;
        if !self.started {
            self.started = true;
            return Some(fragment);
        }
        self.pending = Some(fragment);
        Some(Ok(self.separator.to_string()))
    }
}

pub fn wrap<'a, I>(pre: &'static str, fragments: I, post: &'static str) -> Fragments<'a>
where
    I: Iterator<Item = Fragment> + 'a,
{
    Box::new(
        iter::once(Ok(pre.to_string()))
            .chain(interpose(fragments, ","))
            .chain(iter::once(Ok(post.to_string()))),
    )
}

pub fn deferred<'a, F>(build: F) -> Fragments<'a>
where
    F: FnOnce() -> Result<Fragments<'a>, OtuError> + 'a,
{
    let mut build = Some(build);
    let mut inner: Option<Fragments<'a>> = None;
    Box::new(iter::from_fn(move || {
        if inner.is_none() {
            match build.take()?() {
                Ok(fragments) => inner = Some(fragments),
                Err(err) => return Some(Err(err)),
            }
        }
        inner.as_mut()?.next()
    }))
}
