use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::OtuError;
use crate::filter::{
    ContextualFilter, ContextualTerm, OpAndVal, OtuQueryParams, Range, TaxonomyFilter, TermMatch,
};
use crate::ontology::OntologyInfo;
use crate::schema::{
    AMPLICON_TABLE, ENVIRONMENT_TABLE, FieldDescriptor, FieldKind, SampleSchema, TaxonomyLevel,
};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub taxonomy: TaxonomyRequest,
    #[serde(default)]
    pub contextual: ContextualRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TaxonomyRequest {
    #[serde(default)]
    pub amplicon: Option<SelectionRequest>,
    #[serde(default)]
    pub state: Vec<Option<SelectionRequest>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SelectionRequest {
    #[serde(default = "default_operator")]
    pub operator: String,
    pub value: OntologyRef,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OntologyRef {
    Id(i64),
    Value(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContextualRequest {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub environment: Option<SelectionRequest>,
    #[serde(default)]
    pub terms: Vec<TermRequest>,
}

impl Default for ContextualRequest {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            environment: None,
            terms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TermRequest {
    pub field: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub val_from: Option<JsonValue>,
    #[serde(default)]
    pub val_to: Option<JsonValue>,
    #[serde(default)]
    pub val_contains: Option<String>,
    #[serde(default)]
    pub val_is: Option<OntologyRef>,
    #[serde(default)]
    pub val_is_in: Option<Vec<i64>>,
}

fn default_operator() -> String {
    "is".to_string()
}

fn default_mode() -> String {
    "and".to_string()
}

impl QueryRequest {
    pub fn from_path(path: &Path) -> Result<Self, OtuError> {
        let content = fs::read_to_string(path)
            .map_err(|err| OtuError::Filesystem(format!("{}: {err}", path.display())))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, OtuError> {
        serde_json::from_str(content).map_err(|err| OtuError::InvalidRequest(err.to_string()))
    }

    pub fn into_params(
        self,
        schema: &SampleSchema,
        info: &OntologyInfo,
    ) -> Result<OtuQueryParams, OtuError> {
        Ok(OtuQueryParams::new(
            self.contextual.into_filter(schema, info)?,
            self.taxonomy.into_filter(info)?,
        ))
    }
}

impl TaxonomyRequest {
    pub fn into_filter(self, info: &OntologyInfo) -> Result<TaxonomyFilter, OtuError> {
        let amplicon = self
            .amplicon
            .map(|selection| selection.resolve(info, AMPLICON_TABLE))
            .transpose()?;
        if self.state.is_empty() {
            return Ok(TaxonomyFilter::new(amplicon, Default::default()));
        }
        if self.state.len() != TaxonomyLevel::ALL.len() {
            return Err(OtuError::InvalidTaxonomyState(format!(
                "expected 7 levels, got {}",
                self.state.len()
            )));
        }
        let state = self
            .state
            .into_iter()
            .zip(TaxonomyLevel::ALL)
            .map(|(selection, level)| {
                selection
                    .map(|selection| selection.resolve(info, level.ontology_table()))
                    .transpose()
            })
            .collect::<Result<Vec<_>, OtuError>>()?;
        TaxonomyFilter::from_state(amplicon, state)
    }
}

impl SelectionRequest {
    fn resolve(self, info: &OntologyInfo, table: &str) -> Result<OpAndVal, OtuError> {
        Ok(OpAndVal {
            operator: self.operator.parse()?,
            value: self.value.resolve(info, table)?,
        })
    }
}

impl OntologyRef {
    fn resolve(&self, info: &OntologyInfo, table: &str) -> Result<i64, OtuError> {
        match self {
            OntologyRef::Id(id) => Ok(*id),
            OntologyRef::Value(value) => info
                .value_to_id(table, Some(value.as_str()))?
                .ok_or_else(|| OtuError::OntologyNotFound {
                    table: table.to_string(),
                    key: value.clone(),
                }),
        }
    }
}

impl ContextualRequest {
    pub fn into_filter(
        self,
        schema: &SampleSchema,
        info: &OntologyInfo,
    ) -> Result<ContextualFilter, OtuError> {
        let environment = self
            .environment
            .map(|selection| selection.resolve(info, ENVIRONMENT_TABLE))
            .transpose()?;
        let mut filter = ContextualFilter::new(self.mode.parse()?, environment);
        for term in self.terms {
            filter.add_term(term.into_term(schema, info)?);
        }
        Ok(filter)
    }
}

impl TermRequest {
    pub fn into_term(self, schema: &SampleSchema, info: &OntologyInfo) -> Result<ContextualTerm, OtuError> {
        let field = schema.field(&self.field)?;
        let matcher = self.matcher(field, info)?;
        ContextualTerm::new(schema, &self.field, &self.operator, matcher)
    }

    fn matcher(&self, field: &FieldDescriptor, info: &OntologyInfo) -> Result<TermMatch, OtuError> {
        let mismatch = || OtuError::TermType {
            field: field.name.clone(),
            expected: field.kind.label().to_string(),
            found: self.supplied().to_string(),
        };
        let matcher = match &field.kind {
            FieldKind::Float => {
                // integral JSON numbers are exact floats; strings and bools are not numbers
                let bound = |value: &Option<JsonValue>| match value {
                    Some(JsonValue::Number(number)) => number.as_f64(),
                    _ => None,
                };
                match (bound(&self.val_from), bound(&self.val_to)) {
                    (Some(from), Some(to)) => TermMatch::Between(Range::Float { from, to }),
                    _ => return Err(mismatch()),
                }
            }
            FieldKind::Date => {
                let bound = |value: &Option<JsonValue>| {
                    value
                        .as_ref()
                        .and_then(JsonValue::as_str)
                        .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok())
                };
                match (bound(&self.val_from), bound(&self.val_to)) {
                    (Some(from), Some(to)) => TermMatch::Between(Range::Date { from, to }),
                    _ => return Err(mismatch()),
                }
            }
            FieldKind::Text => TermMatch::Contains(self.val_contains.clone().ok_or_else(mismatch)?),
            FieldKind::Ontology { table } => {
                let value = self.val_is.as_ref().ok_or_else(mismatch)?;
                TermMatch::OntologyEquals(value.resolve(info, table)?)
            }
            FieldKind::SampleId => TermMatch::SampleIdIn(
                self.val_is_in
                    .as_ref()
                    .ok_or_else(mismatch)?
                    .iter()
                    .copied()
                    .collect(),
            ),
        };
        Ok(matcher)
    }

    fn supplied(&self) -> &'static str {
        if self.val_from.is_some() || self.val_to.is_some() {
            "range"
        } else if self.val_contains.is_some() {
            "string"
        } else if self.val_is.is_some() {
            "ontology id"
        } else if self.val_is_in.is_some() {
            "sample id set"
        } else {
            "no value"
        }
    }
}
