use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::CACHE_FOREVER;
use crate::db::{Direction, SelectBuilder};
use crate::error::OtuError;
use crate::filter::TaxonomyFilter;
use crate::query::QueryContext;
use crate::schema::{OTU_TABLE, TaxonomyLevel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOptions {
    pub target: String,
    pub possibilities: Vec<(i64, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyChoices {
    pub new_options: NewOptions,
    pub clear: Vec<String>,
}

pub struct TaxonomyOptions<'ctx> {
    ctx: &'ctx QueryContext,
    session: Connection,
}

impl<'ctx> TaxonomyOptions<'ctx> {
    pub fn new(ctx: &'ctx QueryContext) -> Result<Self, OtuError> {
        Ok(Self {
            ctx,
            session: ctx.database().session()?,
        })
    }

    pub fn possibilities(
        &self,
        taxonomy_filter: &TaxonomyFilter,
        force_cache: bool,
    ) -> Result<Option<TaxonomyChoices>, OtuError> {
        let key = self
            .ctx
            .generation()
            .cache_key(&[&"TaxonomyOptions.possibilities", taxonomy_filter]);
        if force_cache {
            let result = self.compute(taxonomy_filter)?;
            if let Ok(encoded) = serde_json::to_string(&result) {
                self.ctx.cache().set(&key, &encoded, CACHE_FOREVER);
            }
            return Ok(result);
        }
        self.ctx
            .cached(&key, CACHE_FOREVER, || self.compute(taxonomy_filter))
    }

    fn compute(&self, taxonomy_filter: &TaxonomyFilter) -> Result<Option<TaxonomyChoices>, OtuError> {
        let Some(target) = self.determine_target(taxonomy_filter)? else {
            return Ok(None);
        };
        debug!(target = %target, "taxonomy target level");
        let clear = target
            .and_below()
            .iter()
            .map(|level| level.name().to_string())
            .collect();

        let possibilities: Vec<(i64, String)> = if taxonomy_filter.amplicon.is_none() && target == TaxonomyLevel::Kingdom
        {
            SelectBuilder::new(["id", "value"], target.ontology_table())
                .order_by("value", Direction::Asc)
                .order_by("id", Direction::Asc)
                .compile()
                .query_all(&self.session, |row| Ok((row.get(0)?, row.get(1)?)))?
        } else {
            let column = format!("{OTU_TABLE}.{}", target.column());
            let table = target.ontology_table();
            let mut builder =
                SelectBuilder::new([column.clone(), "choice.value".to_string()], OTU_TABLE)
                    .join(format!("JOIN {table} AS choice ON choice.id = {column}"))
                    .filter_opt(taxonomy_filter.amplicon_condition());
            for level in &TaxonomyLevel::ALL[..target.index()] {
                builder = builder.filter_opt(taxonomy_filter.level_condition(*level));
            }
            builder
                .group_by(column.clone())
                .group_by("choice.value")
                .order_by("choice.value", Direction::Asc)
                .order_by(column, Direction::Asc)
                .compile()
                .query_all(&self.session, |row| Ok((row.get(0)?, row.get(1)?)))?
        };

        Ok(Some(TaxonomyChoices {
            new_options: NewOptions {
                target: target.name().to_string(),
                possibilities,
            },
            clear,
        }))
    }

    fn determine_target(
        &self,
        taxonomy_filter: &TaxonomyFilter,
    ) -> Result<Option<TaxonomyLevel>, OtuError> {
        let mut query = SelectBuilder::new(["1"], OTU_TABLE)
            .filter_opt(taxonomy_filter.amplicon_condition());
        for level in TaxonomyLevel::ALL {
            let Some(condition) = taxonomy_filter.level_condition(level) else {
                return Ok(Some(level));
            };
            query = query.filter(condition);
            if !query.clone().limit(1).compile().exists().query_bool(&self.session)? {
                return Ok(Some(level));
            }
        }
        Ok(None)
    }
}
