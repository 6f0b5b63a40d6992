use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::OtuError;

pub const OTU_TABLE: &str = "otu";
pub const SAMPLE_TABLE: &str = "sample_context";
pub const SAMPLE_OTU_TABLE: &str = "sample_otu";
pub const AMPLICON_TABLE: &str = "otu_amplicon";
pub const ENVIRONMENT_TABLE: &str = "environment";
pub const IMPORT_METADATA_TABLE: &str = "import_metadata";
pub const IMPORTED_FILE_TABLE: &str = "imported_file";

pub const AMPLICON_COLUMN: &str = "amplicon_id";
pub const ENVIRONMENT_COLUMN: &str = "environment_id";

pub const SAMPLE_ID_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaxonomyLevel {
    Kingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
}

impl TaxonomyLevel {
    pub const ALL: [TaxonomyLevel; 7] = [
        TaxonomyLevel::Kingdom,
        TaxonomyLevel::Phylum,
        TaxonomyLevel::Class,
        TaxonomyLevel::Order,
        TaxonomyLevel::Family,
        TaxonomyLevel::Genus,
        TaxonomyLevel::Species,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TaxonomyLevel::Kingdom => "kingdom",
            TaxonomyLevel::Phylum => "phylum",
            TaxonomyLevel::Class => "class",
            TaxonomyLevel::Order => "order",
            TaxonomyLevel::Family => "family",
            TaxonomyLevel::Genus => "genus",
            TaxonomyLevel::Species => "species",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            TaxonomyLevel::Kingdom => "kingdom_id",
            TaxonomyLevel::Phylum => "phylum_id",
            TaxonomyLevel::Class => "class_id",
            TaxonomyLevel::Order => "order_id",
            TaxonomyLevel::Family => "family_id",
            TaxonomyLevel::Genus => "genus_id",
            TaxonomyLevel::Species => "species_id",
        }
    }

    pub fn ontology_table(self) -> &'static str {
        match self {
            TaxonomyLevel::Kingdom => "otu_kingdom",
            TaxonomyLevel::Phylum => "otu_phylum",
            TaxonomyLevel::Class => "otu_class",
            TaxonomyLevel::Order => "otu_order",
            TaxonomyLevel::Family => "otu_family",
            TaxonomyLevel::Genus => "otu_genus",
            TaxonomyLevel::Species => "otu_species",
        }
    }

    pub fn and_below(self) -> &'static [TaxonomyLevel] {
        &Self::ALL[self.index()..]
    }
}

impl fmt::Display for TaxonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldKind {
    Float,
    Date,
    #[serde(alias = "string")]
    Text,
    Ontology { table: String },
    #[serde(skip)]
    SampleId,
}

impl FieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Float => "float",
            FieldKind::Date => "date",
            FieldKind::Text => "string",
            FieldKind::Ontology { .. } => "ontology",
            FieldKind::SampleId => "sample id",
        }
    }

    pub fn ontology_table(&self) -> Option<&str> {
        match self {
            FieldKind::Ontology { table } => Some(table),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub display_name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub fn new(name: &str, display_name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            kind,
        }
    }

    pub fn column(&self) -> String {
        format!("{SAMPLE_TABLE}.{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleSchema {
    fields: Vec<FieldDescriptor>,
    sample_id: FieldDescriptor,
}

impl SampleSchema {
    pub fn new(fields: Vec<FieldDescriptor>) -> Result<Self, OtuError> {
        let mut seen = std::collections::HashSet::new();
        for field in &fields {
            let valid_name = !field.name.is_empty()
                && field
                    .name
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
            let reserved = field.name == SAMPLE_ID_FIELD || field.name == ENVIRONMENT_COLUMN;
            if !valid_name || reserved || matches!(field.kind, FieldKind::SampleId) {
                return Err(OtuError::UnknownField(field.name.clone()));
            }
            if !seen.insert(field.name.clone()) {
                return Err(OtuError::UnknownField(format!(
                    "{} (declared twice)",
                    field.name
                )));
            }
        }
        Ok(Self {
            fields,
            sample_id: FieldDescriptor::new(SAMPLE_ID_FIELD, "Sample ID", FieldKind::SampleId),
        })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Result<&FieldDescriptor, OtuError> {
        if name == SAMPLE_ID_FIELD {
            return Ok(&self.sample_id);
        }
        self.fields
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| OtuError::UnknownField(name.to_string()))
    }

    pub fn display_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.field(name)
            .map(|field| field.display_name.as_str())
            .unwrap_or(name)
    }
}

impl Default for SampleSchema {
    fn default() -> Self {
        Self {
            fields: default_fields(),
            sample_id: FieldDescriptor::new(SAMPLE_ID_FIELD, "Sample ID", FieldKind::SampleId),
        }
    }
}

pub fn default_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("ph", "pH", FieldKind::Float),
        FieldDescriptor::new("depth", "Depth", FieldKind::Text),
        FieldDescriptor::new("collection_date", "Collection Date", FieldKind::Date),
        FieldDescriptor::new("latitude", "Latitude", FieldKind::Float),
        FieldDescriptor::new("longitude", "Longitude", FieldKind::Float),
        FieldDescriptor::new("horizon_classification", "Horizon", FieldKind::Text),
        FieldDescriptor::new(
            "vegetation_type_id",
            "Vegetation Type",
            FieldKind::Ontology {
                table: "vegetation_type".to_string(),
            },
        ),
        FieldDescriptor::new(
            "broad_land_use_id",
            "Broad Land Use",
            FieldKind::Ontology {
                table: "land_use".to_string(),
            },
        ),
        FieldDescriptor::new(
            "detailed_land_use_id",
            "Detailed Land Use",
            FieldKind::Ontology {
                table: "land_use".to_string(),
            },
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn non_empty(self) -> FieldValue {
        match self {
            FieldValue::Text(value) if value.is_empty() => FieldValue::Null,
            other => other,
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            FieldValue::Null => "null".to_string(),
            FieldValue::Integer(value) => value.to_string(),
            FieldValue::Float(value) => {
                serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
            }
            FieldValue::Date(value) => json_string(&value.to_string()),
            FieldValue::Text(value) => json_string(value),
        }
    }

    pub(crate) fn read(
        row: &rusqlite::Row<'_>,
        idx: usize,
        kind: &FieldKind,
    ) -> rusqlite::Result<FieldValue> {
        let value = match kind {
            FieldKind::Float => row.get::<_, Option<f64>>(idx)?.map(FieldValue::Float),
            FieldKind::Date => row.get::<_, Option<NaiveDate>>(idx)?.map(FieldValue::Date),
            FieldKind::Text => row.get::<_, Option<String>>(idx)?.map(FieldValue::Text),
            FieldKind::Ontology { .. } | FieldKind::SampleId => {
                row.get::<_, Option<i64>>(idx)?.map(FieldValue::Integer)
            }
        };
        Ok(value.unwrap_or(FieldValue::Null))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Integer(value) => write!(f, "{value}"),
            FieldValue::Float(value) => write!(f, "{value:?}"),
            FieldValue::Date(value) => write!(f, "{value}"),
            FieldValue::Text(value) => write!(f, "{value}"),
        }
    }
}

pub(crate) fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleContext {
    pub id: i64,
    pub environment_id: Option<i64>,
    pub values: BTreeMap<String, FieldValue>,
}

impl SampleContext {
    pub fn value(&self, field: &str) -> FieldValue {
        if field == ENVIRONMENT_COLUMN {
            return self
                .environment_id
                .map(FieldValue::Integer)
                .unwrap_or(FieldValue::Null);
        }
        self.values.get(field).cloned().unwrap_or(FieldValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Otu {
    pub id: i64,
    pub code: String,
    pub amplicon_id: Option<i64>,
    pub taxonomy: [Option<i64>; 7],
}

impl Otu {
    pub fn level(&self, level: TaxonomyLevel) -> Option<i64> {
        self.taxonomy[level.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleOtu {
    pub sample_id: i64,
    pub otu_id: i64,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn levels_below_include_self() {
        let names: Vec<_> = TaxonomyLevel::Genus
            .and_below()
            .iter()
            .map(|level| level.name())
            .collect();
        assert_eq!(names, vec!["genus", "species"]);
        assert_eq!(TaxonomyLevel::Kingdom.and_below().len(), 7);
    }

    #[test]
    fn schema_rejects_reserved_and_duplicate_names() {
        let err = SampleSchema::new(vec![FieldDescriptor::new("id", "Id", FieldKind::Float)])
            .unwrap_err();
        assert_matches!(err, OtuError::UnknownField(_));

        let err = SampleSchema::new(vec![
            FieldDescriptor::new("ph", "pH", FieldKind::Float),
            FieldDescriptor::new("ph", "pH again", FieldKind::Float),
        ])
        .unwrap_err();
        assert_matches!(err, OtuError::UnknownField(_));

        let err = SampleSchema::new(vec![FieldDescriptor::new(
            "ph; drop",
            "pH",
            FieldKind::Float,
        )])
        .unwrap_err();
        assert_matches!(err, OtuError::UnknownField(_));
    }

    #[test]
    fn sample_id_pseudo_field_always_resolves() {
        let schema = SampleSchema::new(Vec::new()).unwrap();
        let field = schema.field("id").unwrap();
        assert_eq!(field.kind, FieldKind::SampleId);
        assert_eq!(schema.display_name("id"), "Sample ID");
        assert_matches!(schema.field("ph"), Err(OtuError::UnknownField(_)));
    }

    #[test]
    fn field_values_render_as_json() {
        assert_eq!(FieldValue::Null.to_json(), "null");
        assert_eq!(FieldValue::Float(5.0).to_json(), "5.0");
        assert_eq!(
            FieldValue::Date(NaiveDate::from_ymd_opt(2016, 3, 4).unwrap()).to_json(),
            "\"2016-03-04\""
        );
        assert_eq!(
            FieldValue::Text("a \"quoted\"\nline".to_string()).to_json(),
            "\"a \\\"quoted\\\"\\nline\""
        );
        assert_eq!(FieldValue::Text(String::new()).non_empty(), FieldValue::Null);
    }

    #[test]
    fn field_descriptor_parses_from_config_json() {
        let field: FieldDescriptor = serde_json::from_str(
            r#"{"name": "vegetation_type_id", "display_name": "Vegetation", "kind": "ontology", "table": "vegetation_type"}"#,
        )
        .unwrap();
        assert_eq!(field.kind.ontology_table(), Some("vegetation_type"));

        let field: FieldDescriptor =
            serde_json::from_str(r#"{"name": "depth", "display_name": "Depth", "kind": "string"}"#)
                .unwrap();
        assert_eq!(field.kind, FieldKind::Text);
    }
}
