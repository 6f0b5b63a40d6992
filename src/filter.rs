use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::cache::CacheRepr;
use crate::db::Condition;
use crate::error::OtuError;
use crate::ontology::OntologyInfo;
use crate::query::ImportMetadata;
use crate::schema::{
    AMPLICON_COLUMN, AMPLICON_TABLE, ENVIRONMENT_COLUMN, ENVIRONMENT_TABLE, FieldDescriptor,
    FieldKind, OTU_TABLE, SAMPLE_TABLE, SampleSchema, TaxonomyLevel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Is,
    IsNot,
}

impl Operator {
    fn describe(self) -> &'static str {
        match self {
            Operator::Is => "is",
            Operator::IsNot => "is not",
        }
    }
}

impl FromStr for Operator {
    type Err = OtuError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "is" => Ok(Operator::Is),
            "isnot" => Ok(Operator::IsNot),
            other => Err(OtuError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Is => write!(f, "is"),
            Operator::IsNot => write!(f, "isnot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpAndVal {
    pub operator: Operator,
    pub value: i64,
}

impl OpAndVal {
    pub fn is(value: i64) -> Self {
        Self {
            operator: Operator::Is,
            value,
        }
    }

    pub fn is_not(value: i64) -> Self {
        Self {
            operator: Operator::IsNot,
            value,
        }
    }

    pub fn condition(&self, column: &str) -> Condition {
        match self.operator {
            Operator::Is => Condition::eq(column, self.value),
            Operator::IsNot => Condition::ne(column, self.value),
        }
    }

    fn describe(&self, info: &OntologyInfo, name: &str, table: &str) -> Result<String, OtuError> {
        let value = info
            .id_to_value(table, Some(self.value))?
            .unwrap_or_default();
        Ok(format!("{name} {} '{value}'", self.operator.describe()))
    }
}

impl CacheRepr for OpAndVal {
    fn cache_repr(&self) -> String {
        format!("{{operator:{},value:{}}}", self.operator, self.value)
    }
}

impl CacheRepr for Option<OpAndVal> {
    fn cache_repr(&self) -> String {
        match self {
            Some(op) => op.cache_repr(),
            None => "None".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TaxonomyFilter {
    pub amplicon: Option<OpAndVal>,
    pub state: [Option<OpAndVal>; 7],
}

impl TaxonomyFilter {
    pub fn new(amplicon: Option<OpAndVal>, state: [Option<OpAndVal>; 7]) -> Self {
        Self { amplicon, state }
    }

    pub fn from_state(
        amplicon: Option<OpAndVal>,
        state: Vec<Option<OpAndVal>>,
    ) -> Result<Self, OtuError> {
        let len = state.len();
        let state: [Option<OpAndVal>; 7] = state.try_into().map_err(|_| {
            OtuError::InvalidTaxonomyState(format!("expected 7 levels, got {len}"))
        })?;
        Ok(Self { amplicon, state })
    }

    pub fn level(&self, level: TaxonomyLevel) -> Option<OpAndVal> {
        self.state[level.index()]
    }

    pub fn with_level(mut self, level: TaxonomyLevel, selection: Option<OpAndVal>) -> Self {
        self.state[level.index()] = selection;
        self
    }

    pub fn cleared_from(mut self, level: TaxonomyLevel) -> Self {
        for below in level.and_below() {
            self.state[below.index()] = None;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.amplicon.is_none() && self.state.iter().all(Option::is_none)
    }

    pub fn amplicon_condition(&self) -> Option<Condition> {
        self.amplicon
            .map(|op| op.condition(&format!("{OTU_TABLE}.{AMPLICON_COLUMN}")))
    }

    pub fn level_condition(&self, level: TaxonomyLevel) -> Option<Condition> {
        self.level(level)
            .map(|op| op.condition(&format!("{OTU_TABLE}.{}", level.column())))
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.amplicon_condition()
            .into_iter()
            .chain(
                TaxonomyLevel::ALL
                    .iter()
                    .filter_map(|level| self.level_condition(*level)),
            )
            .collect()
    }

    pub fn describe(&self, info: &OntologyInfo) -> Result<(Option<String>, Vec<String>), OtuError> {
        let amplicon = self
            .amplicon
            .map(|op| op.describe(info, "amplicon", AMPLICON_TABLE))
            .transpose()?;
        let mut levels = Vec::new();
        for level in TaxonomyLevel::ALL {
            if let Some(op) = self.level(level) {
                levels.push(op.describe(info, level.name(), level.ontology_table())?);
            }
        }
        Ok((amplicon, levels))
    }
}

impl CacheRepr for TaxonomyFilter {
    fn cache_repr(&self) -> String {
        let state: Vec<String> = self.state.iter().map(CacheRepr::cache_repr).collect();
        format!(
            "<TaxonomyFilter({},state_vec[{}])>",
            self.amplicon.cache_repr(),
            state.join(",")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    And,
    Or,
}

impl FromStr for Mode {
    type Err = OtuError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "and" => Ok(Mode::And),
            "or" => Ok(Mode::Or),
            other => Err(OtuError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::And => write!(f, "and"),
            Mode::Or => write!(f, "or"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Range {
    Float { from: f64, to: f64 },
    Date { from: NaiveDate, to: NaiveDate },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TermMatch {
    Between(Range),
    Contains(String),
    OntologyEquals(i64),
    SampleIdIn(BTreeSet<i64>),
}

impl TermMatch {
    fn label(&self) -> &'static str {
        match self {
            TermMatch::Between(Range::Float { .. }) => "float range",
            TermMatch::Between(Range::Date { .. }) => "date range",
            TermMatch::Contains(_) => "string",
            TermMatch::OntologyEquals(_) => "ontology id",
            TermMatch::SampleIdIn(_) => "sample id set",
        }
    }

    fn fits(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (TermMatch::Between(Range::Float { .. }), FieldKind::Float)
                | (TermMatch::Between(Range::Date { .. }), FieldKind::Date)
                | (TermMatch::Contains(_), FieldKind::Text)
                | (TermMatch::OntologyEquals(_), FieldKind::Ontology { .. })
                | (TermMatch::SampleIdIn(_), FieldKind::SampleId)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextualTerm {
    field: FieldDescriptor,
    complement: bool,
    matcher: TermMatch,
}

impl ContextualTerm {
    pub fn new(
        schema: &SampleSchema,
        field_name: &str,
        operator: &str,
        matcher: TermMatch,
    ) -> Result<Self, OtuError> {
        let field = schema.field(field_name)?.clone();
        let complement = match operator {
            "complement" => true,
            "is" | "" => false,
            other => return Err(OtuError::UnknownOperator(other.to_string())),
        };
        if !matcher.fits(&field.kind) {
            return Err(OtuError::TermType {
                field: field.name.clone(),
                expected: field.kind.label().to_string(),
                found: matcher.label().to_string(),
            });
        }
        Ok(Self {
            field,
            complement,
            matcher,
        })
    }

    pub fn field(&self) -> &FieldDescriptor {
        &self.field
    }

    pub fn is_complement(&self) -> bool {
        self.complement
    }

    pub fn matcher(&self) -> &TermMatch {
        &self.matcher
    }

    fn positive_conditions(&self) -> Vec<Condition> {
        let column = self.field.column();
        let condition = match &self.matcher {
            TermMatch::Between(Range::Float { from, to }) => Condition::new(
                format!("{column} BETWEEN ? AND ?"),
                vec![Value::Real(*from), Value::Real(*to)],
            ),
            TermMatch::Between(Range::Date { from, to }) => Condition::new(
                format!("{column} BETWEEN ? AND ?"),
                vec![Value::Text(from.to_string()), Value::Text(to.to_string())],
            ),
            TermMatch::Contains(needle) => Condition::new(
                format!("instr({column}, ?) > 0"),
                vec![Value::Text(needle.clone())],
            ),
            TermMatch::OntologyEquals(id) => Condition::eq(&column, *id),
            TermMatch::SampleIdIn(ids) if ids.is_empty() => Condition::always_false(),
            TermMatch::SampleIdIn(ids) => {
                let placeholders = vec!["?"; ids.len()].join(", ");
                Condition::new(
                    format!("{column} IN ({placeholders})"),
                    ids.iter().map(|id| Value::Integer(*id)).collect(),
                )
            }
        };
        vec![condition]
    }

    pub fn conditions(&self) -> Vec<Condition> {
        let conditions = self.positive_conditions();
        if self.complement {
            return conditions.into_iter().map(Condition::not).collect();
        }
        conditions
    }

    pub fn describe(&self, info: &OntologyInfo) -> Result<String, OtuError> {
        let name = &self.field.display_name;
        let text = match (&self.matcher, self.complement) {
            (TermMatch::Between(range), false) => {
                let (from, to) = range_bounds(range);
                format!("{from}<={name}<={to}")
            }
            (TermMatch::Between(range), true) => {
                let (from, to) = range_bounds(range);
                format!("{name}<{from},{name}>{to}")
            }
            (TermMatch::Contains(needle), false) => format!("{name} contains \"{needle}\""),
            (TermMatch::Contains(needle), true) => {
                format!("{name} does not contain \"{needle}\"")
            }
            (TermMatch::OntologyEquals(id), complement) => {
                let table = self.field.kind.ontology_table().unwrap_or_default();
                let value = info.id_to_value(table, Some(*id))?.unwrap_or_default();
                if complement {
                    format!("{name} is not '{value}'")
                } else {
                    format!("{name} is '{value}'")
                }
            }
            (TermMatch::SampleIdIn(ids), complement) => {
                let ids: Vec<i64> = ids.iter().copied().collect();
                if complement {
                    format!("{name} is not in \"{ids:?}\"")
                } else {
                    format!("{name} is in \"{ids:?}\"")
                }
            }
        };
        Ok(text)
    }
}

fn range_bounds(range: &Range) -> (String, String) {
    match range {
        Range::Float { from, to } => (format!("{from:?}"), format!("{to:?}")),
        Range::Date { from, to } => (from.to_string(), to.to_string()),
    }
}

impl CacheRepr for ContextualTerm {
    fn cache_repr(&self) -> String {
        let operator = if self.complement { "complement" } else { "is" };
        let field = &self.field.name;
        match &self.matcher {
            TermMatch::Between(Range::Float { from, to }) => {
                format!("<TermFloat({field},{operator},{from:?},{to:?})>")
            }
            TermMatch::Between(Range::Date { from, to }) => {
                format!("<TermDate({field},{operator},{from},{to})>")
            }
            TermMatch::Contains(needle) => {
                format!("<TermString({field},{operator},{needle:?})>")
            }
            TermMatch::OntologyEquals(id) => format!("<TermOntology({field},{operator},{id})>"),
            TermMatch::SampleIdIn(ids) => {
                let ids: Vec<i64> = ids.iter().copied().collect();
                format!("<TermSampleID({field},{operator},{ids:?})>")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextualFilter {
    pub mode: Mode,
    pub environment: Option<OpAndVal>,
    terms: Vec<ContextualTerm>,
}

impl ContextualFilter {
    pub fn new(mode: Mode, environment: Option<OpAndVal>) -> Self {
        Self {
            mode,
            environment,
            terms: Vec::new(),
        }
    }

    pub fn add_term(&mut self, term: ContextualTerm) {
        self.terms.push(term);
    }

    pub fn with_term(mut self, term: ContextualTerm) -> Self {
        self.add_term(term);
        self
    }

    pub fn terms(&self) -> &[ContextualTerm] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.environment.is_none()
    }

    pub fn environment_condition(&self) -> Option<Condition> {
        self.environment
            .map(|op| op.condition(&format!("{SAMPLE_TABLE}.{ENVIRONMENT_COLUMN}")))
    }

    pub fn conditions(&self) -> Vec<Condition> {
        let terms: Vec<Condition> = self
            .terms
            .iter()
            .flat_map(ContextualTerm::conditions)
            .collect();
        let combined = match self.mode {
            Mode::And => Condition::all(terms),
            Mode::Or => Condition::any(terms),
        };
        self.environment_condition()
            .into_iter()
            .chain(combined)
            .collect()
    }

    pub fn describe(&self, info: &OntologyInfo) -> Result<Vec<String>, OtuError> {
        let mut parts = Vec::new();
        if let Some(op) = self.environment {
            parts.push(op.describe(info, "environment", ENVIRONMENT_TABLE)?);
        }
        for term in &self.terms {
            parts.push(term.describe(info)?);
        }
        Ok(parts)
    }
}

impl Default for ContextualFilter {
    fn default() -> Self {
        Self::new(Mode::And, None)
    }
}

impl CacheRepr for ContextualFilter {
    fn cache_repr(&self) -> String {
        let terms: Vec<String> = self.terms.iter().map(CacheRepr::cache_repr).collect();
        format!(
            "<ContextualFilter({},env[{}],[{}]>",
            self.mode,
            self.environment.cache_repr(),
            terms.join(",")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OtuQueryParams {
    pub contextual_filter: ContextualFilter,
    pub taxonomy_filter: TaxonomyFilter,
}

impl OtuQueryParams {
    pub fn new(contextual_filter: ContextualFilter, taxonomy_filter: TaxonomyFilter) -> Self {
        Self {
            contextual_filter,
            taxonomy_filter,
        }
    }

    pub fn filename(&self, timestamp: &str, extension: &str) -> String {
        format!("OtuExport-{timestamp}{extension}")
    }

    pub fn summary(&self, info: &OntologyInfo) -> Result<String, OtuError> {
        let (amplicon, taxonomy) = self.taxonomy_filter.describe(info)?;
        let mut parts = Vec::new();
        parts.extend(amplicon);
        parts.extend(taxonomy.last().cloned());
        parts.extend(self.contextual_filter.describe(info)?);
        Ok(format!("OTU query: {}", parts.join("; ")))
    }

    pub fn describe(
        &self,
        info: &OntologyInfo,
        metadata: &ImportMetadata,
    ) -> Result<String, OtuError> {
        const INDENT: &str = "  ";
        let (amplicon, taxonomy) = self.taxonomy_filter.describe(info)?;

        let mut amplicon_section = vec!["Amplicon filter:".to_string()];
        amplicon_section.push(format!(
            "{INDENT}{}",
            amplicon.unwrap_or_else(|| "(no amplicon filter applied)".to_string())
        ));

        let mut taxonomy_section = vec!["Taxonomy filter:".to_string()];
        if taxonomy.is_empty() {
            taxonomy_section.push(format!("{INDENT}(no taxonomy filter applied)"));
        } else {
            taxonomy_section.extend(taxonomy.iter().map(|line| format!("{INDENT}{line}")));
        }

        let mut contextual_section = vec!["Contextual filter:".to_string()];
        contextual_section.extend(
            self.contextual_filter
                .describe(info)?
                .into_iter()
                .map(|line| format!("{INDENT}{line}")),
        );

        let metadata_section = vec![
            "Dataset metadata:".to_string(),
            format!("{INDENT}Dataset methodology={}", metadata.methodology),
            format!("{INDENT}Dataset revision date={}", metadata.revision_date),
        ];

        Ok([
            amplicon_section,
            taxonomy_section,
            contextual_section,
            metadata_section,
        ]
        .iter()
        .map(|section| section.join("\n"))
        .collect::<Vec<_>>()
        .join("\n\n"))
    }
}

impl CacheRepr for OtuQueryParams {
    fn cache_repr(&self) -> String {
        format!(
            "OtuQueryParams<{},{}>",
            self.contextual_filter.cache_repr(),
            self.taxonomy_filter.cache_repr()
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn schema() -> SampleSchema {
        SampleSchema::default()
    }

    #[test]
    fn term_type_must_match_field_kind() {
        let err = ContextualTerm::new(
            &schema(),
            "ph",
            "is",
            TermMatch::Contains("acid".to_string()),
        )
        .unwrap_err();
        assert_matches!(err, OtuError::TermType { .. });

        let err = ContextualTerm::new(
            &schema(),
            "collection_date",
            "is",
            TermMatch::Between(Range::Float { from: 1.0, to: 2.0 }),
        )
        .unwrap_err();
        assert_matches!(err, OtuError::TermType { .. });

        let err = ContextualTerm::new(
            &schema(),
            "vegetation_type_id",
            "is",
            TermMatch::SampleIdIn(BTreeSet::from([1])),
        )
        .unwrap_err();
        assert_matches!(err, OtuError::TermType { .. });
    }

    #[test]
    fn unknown_operator_and_field_fail_at_construction() {
        let err = ContextualTerm::new(&schema(), "ph", "nearly", TermMatch::Contains(String::new()))
            .unwrap_err();
        assert_matches!(err, OtuError::UnknownOperator(_));

        let err = ContextualTerm::new(&schema(), "salinity", "is", TermMatch::OntologyEquals(1))
            .unwrap_err();
        assert_matches!(err, OtuError::UnknownField(_));

        assert_matches!("xor".parse::<Mode>(), Err(OtuError::UnknownMode(_)));
        assert_matches!("maybe".parse::<Operator>(), Err(OtuError::UnknownOperator(_)));
    }

    #[test]
    fn taxonomy_state_must_have_seven_levels() {
        let err = TaxonomyFilter::from_state(None, vec![None; 3]).unwrap_err();
        assert_matches!(err, OtuError::InvalidTaxonomyState(_));
        assert!(TaxonomyFilter::from_state(None, vec![None; 7]).unwrap().is_empty());
    }

    #[test]
    fn clearing_a_level_clears_everything_below() {
        let filter = TaxonomyFilter::default()
            .with_level(TaxonomyLevel::Kingdom, Some(OpAndVal::is(1)))
            .with_level(TaxonomyLevel::Phylum, Some(OpAndVal::is(2)))
            .with_level(TaxonomyLevel::Class, Some(OpAndVal::is(3)))
            .cleared_from(TaxonomyLevel::Phylum);
        assert_eq!(filter.level(TaxonomyLevel::Kingdom), Some(OpAndVal::is(1)));
        assert!(filter.state[1..].iter().all(Option::is_none));
    }

    #[test]
    fn taxonomy_conditions_follow_active_levels() {
        let filter = TaxonomyFilter::new(Some(OpAndVal::is_not(4)), Default::default())
            .with_level(TaxonomyLevel::Kingdom, Some(OpAndVal::is(1)))
            .with_level(TaxonomyLevel::Order, Some(OpAndVal::is(7)));
        let sql: Vec<String> = filter.conditions().into_iter().map(|c| c.sql).collect();
        assert_eq!(
            sql,
            vec![
                "otu.amplicon_id != ?",
                "otu.kingdom_id = ?",
                "otu.order_id = ?"
            ]
        );
    }

    #[test]
    fn contextual_conditions_keep_environment_outside_mode() {
        let filter = ContextualFilter::new(Mode::Or, Some(OpAndVal::is(2)))
            .with_term(
                ContextualTerm::new(
                    &schema(),
                    "ph",
                    "is",
                    TermMatch::Between(Range::Float { from: 5.0, to: 7.0 }),
                )
                .unwrap(),
            )
            .with_term(
                ContextualTerm::new(
                    &schema(),
                    "depth",
                    "complement",
                    TermMatch::Contains("10cm".to_string()),
                )
                .unwrap(),
            );
        let conditions = filter.conditions();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].sql, "sample_context.environment_id = ?");
        assert_eq!(
            conditions[1].sql,
            "(sample_context.ph BETWEEN ? AND ?) OR \
             (COALESCE((instr(sample_context.depth, ?) > 0), 0) = 0)"
        );
        assert_eq!(conditions[1].params.len(), 3);
    }

    #[test]
    fn empty_sample_id_set_matches_nothing() {
        let term =
            ContextualTerm::new(&schema(), "id", "is", TermMatch::SampleIdIn(BTreeSet::new()))
                .unwrap();
        assert_eq!(term.conditions()[0].sql, "0");
    }

    #[test]
    fn cache_repr_is_content_based() {
        let build = |ids: Vec<i64>| {
            ContextualFilter::new(Mode::And, None).with_term(
                ContextualTerm::new(
                    &schema(),
                    "id",
                    "is",
                    TermMatch::SampleIdIn(ids.into_iter().collect()),
                )
                .unwrap(),
            )
        };
        assert_eq!(build(vec![3, 1, 2]).cache_repr(), build(vec![1, 2, 3]).cache_repr());
        assert_eq!(
            build(vec![1, 2]).cache_repr(),
            "<ContextualFilter(and,env[None],[<TermSampleID(id,is,[1, 2])>]>"
        );

        let taxonomy = TaxonomyFilter::default().with_level(TaxonomyLevel::Kingdom, Some(OpAndVal::is(1)));
        assert_eq!(
            taxonomy.cache_repr(),
            "<TaxonomyFilter(None,state_vec[{operator:is,value:1},None,None,None,None,None,None])>"
        );
    }
}
