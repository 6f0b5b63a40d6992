mod common;

use std::sync::Arc;

use common::Fixture;
use otu_query::cache::MemoryCache;
use otu_query::filter::{OpAndVal, TaxonomyFilter};
use otu_query::schema::TaxonomyLevel;
use otu_query::taxonomy::{TaxonomyChoices, TaxonomyOptions};

fn names(levels: &[TaxonomyLevel]) -> Vec<String> {
    levels.iter().map(|level| level.name().to_string()).collect()
}

fn choices(fixture: &Fixture, filter: &TaxonomyFilter) -> Option<TaxonomyChoices> {
    let ctx = fixture.context();
    TaxonomyOptions::new(&ctx)
        .unwrap()
        .possibilities(filter, false)
        .unwrap()
}

fn possibilities(pairs: &[(i64, &str)]) -> Vec<(i64, String)> {
    pairs
        .iter()
        .map(|(id, value)| (*id, value.to_string()))
        .collect()
}

#[test]
fn empty_selection_offers_every_kingdom() {
    let fixture = Fixture::contextual();
    let result = choices(&fixture, &TaxonomyFilter::default()).unwrap();
    assert_eq!(result.new_options.target, "kingdom");
    assert_eq!(
        result.new_options.possibilities,
        possibilities(&[(2, "Archaea"), (1, "Bacteria")])
    );
    assert_eq!(result.clear, names(&TaxonomyLevel::ALL));
}

#[test]
fn selected_kingdom_narrows_phylum_choices() {
    let fixture = Fixture::contextual();
    let filter =
        TaxonomyFilter::default().with_level(TaxonomyLevel::Kingdom, Some(OpAndVal::is(1)));
    let result = choices(&fixture, &filter).unwrap();
    assert_eq!(result.new_options.target, "phylum");
    assert_eq!(
        result.new_options.possibilities,
        possibilities(&[(3, "Firmicutes"), (1, "Proteobacteria")])
    );
    assert_eq!(result.clear, names(&TaxonomyLevel::ALL[1..]));

    let filter =
        TaxonomyFilter::default().with_level(TaxonomyLevel::Kingdom, Some(OpAndVal::is_not(1)));
    let result = choices(&fixture, &filter).unwrap();
    assert_eq!(result.new_options.target, "phylum");
    assert_eq!(
        result.new_options.possibilities,
        possibilities(&[(2, "Euryarchaeota")])
    );
}

#[test]
fn unsatisfiable_level_is_the_target() {
    let fixture = Fixture::contextual();
    let filter = TaxonomyFilter::default()
        .with_level(TaxonomyLevel::Kingdom, Some(OpAndVal::is(1)))
        .with_level(TaxonomyLevel::Phylum, Some(OpAndVal::is(2)))
        .with_level(TaxonomyLevel::Class, Some(OpAndVal::is(1)));
    let result = choices(&fixture, &filter).unwrap();
    assert_eq!(result.new_options.target, "phylum");
    assert_eq!(
        result.new_options.possibilities,
        possibilities(&[(3, "Firmicutes"), (1, "Proteobacteria")])
    );
    assert_eq!(result.clear, names(&TaxonomyLevel::ALL[1..]));
}

#[test]
fn clearing_a_level_reports_it_and_everything_after() {
    let fixture = Fixture::contextual();
    let filter = TaxonomyFilter::default()
        .with_level(TaxonomyLevel::Kingdom, Some(OpAndVal::is(1)))
        .with_level(TaxonomyLevel::Phylum, Some(OpAndVal::is(1)))
        .with_level(TaxonomyLevel::Class, Some(OpAndVal::is(1)));
    for level in [TaxonomyLevel::Phylum, TaxonomyLevel::Class] {
        let result = choices(&fixture, &filter.clone().cleared_from(level)).unwrap();
        assert_eq!(result.new_options.target, level.name());
        assert_eq!(result.clear, names(level.and_below()));
        assert!(!result.clear.contains(&"kingdom".to_string()));
    }
}

#[test]
fn amplicon_selection_skips_kingdom_shortcut() {
    let fixture = Fixture::contextual();
    for amplicon in [OpAndVal::is(2), OpAndVal::is_not(1)] {
        let filter = TaxonomyFilter::new(Some(amplicon), Default::default());
        let result = choices(&fixture, &filter).unwrap();
        assert_eq!(result.new_options.target, "kingdom");
        assert_eq!(
            result.new_options.possibilities,
            possibilities(&[(1, "Bacteria")])
        );
    }
}

#[test]
fn complete_selection_has_no_options() {
    let fixture = Fixture::contextual();
    let mut filter = TaxonomyFilter::default();
    for level in TaxonomyLevel::ALL {
        filter = filter.with_level(level, Some(OpAndVal::is(1)));
    }
    assert_eq!(choices(&fixture, &filter), None);
}

#[test]
fn options_are_cached_until_forced() {
    let fixture = Fixture::contextual();
    let cache = Arc::new(MemoryCache::new());
    let ctx = fixture.context_with(cache.clone());
    let filter = TaxonomyFilter::default();

    let first = TaxonomyOptions::new(&ctx)
        .unwrap()
        .possibilities(&filter, false)
        .unwrap()
        .unwrap();
    assert_eq!(first.new_options.possibilities.len(), 2);
    assert_eq!(cache.len(), 1);

    fixture
        .writer()
        .execute("DELETE FROM otu_kingdom WHERE id = 2", [])
        .unwrap();

    let options = TaxonomyOptions::new(&ctx).unwrap();
    let cached = options.possibilities(&filter, false).unwrap().unwrap();
    assert_eq!(cached, first);

    let forced = options.possibilities(&filter, true).unwrap().unwrap();
    assert_eq!(forced.new_options.possibilities, possibilities(&[(1, "Bacteria")]));
    let after = options.possibilities(&filter, false).unwrap().unwrap();
    assert_eq!(after, forced);
}
