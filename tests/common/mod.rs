#![allow(dead_code)]

use std::sync::Arc;

use camino::Utf8PathBuf;
use rusqlite::Connection;
use tempfile::TempDir;

use otu_query::cache::{NoCache, ResultCache};
use otu_query::db::Database;
use otu_query::query::QueryContext;
use otu_query::schema::SampleSchema;

const SCHEMA: &str = r#"
CREATE TABLE otu_amplicon (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE otu_kingdom (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE otu_phylum (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE otu_class (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE otu_order (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE otu_family (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE otu_genus (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE otu_species (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE environment (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE vegetation_type (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE land_use (id INTEGER PRIMARY KEY, value TEXT NOT NULL);

CREATE TABLE otu (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL,
    amplicon_id INTEGER REFERENCES otu_amplicon (id),
    kingdom_id INTEGER REFERENCES otu_kingdom (id),
    phylum_id INTEGER REFERENCES otu_phylum (id),
    class_id INTEGER REFERENCES otu_class (id),
    order_id INTEGER REFERENCES otu_order (id),
    family_id INTEGER REFERENCES otu_family (id),
    genus_id INTEGER REFERENCES otu_genus (id),
    species_id INTEGER REFERENCES otu_species (id)
);

CREATE TABLE sample_context (
    id INTEGER PRIMARY KEY,
    environment_id INTEGER REFERENCES environment (id),
    ph REAL,
    depth TEXT,
    collection_date TEXT,
    latitude REAL,
    longitude REAL,
    horizon_classification TEXT,
    vegetation_type_id INTEGER REFERENCES vegetation_type (id),
    broad_land_use_id INTEGER REFERENCES land_use (id),
    detailed_land_use_id INTEGER REFERENCES land_use (id)
);

CREATE TABLE sample_otu (
    sample_id INTEGER NOT NULL REFERENCES sample_context (id),
    otu_id INTEGER NOT NULL REFERENCES otu (id),
    count INTEGER NOT NULL,
    PRIMARY KEY (sample_id, otu_id)
);

CREATE TABLE import_metadata (uuid TEXT, methodology TEXT, revision_date TEXT);
CREATE TABLE imported_file (
    filename TEXT,
    file_type TEXT,
    file_size INTEGER,
    rows_imported INTEGER,
    rows_skipped INTEGER
);

INSERT INTO otu_amplicon VALUES (1, '16S'), (2, '18S');
INSERT INTO otu_kingdom VALUES (1, 'Bacteria'), (2, 'Archaea');
INSERT INTO otu_phylum VALUES (1, 'Proteobacteria'), (2, 'Euryarchaeota'), (3, 'Firmicutes');
INSERT INTO otu_class VALUES (1, 'Alphaproteobacteria'), (2, 'Bacilli');
INSERT INTO otu_order VALUES (1, 'Rhizobiales');
INSERT INTO otu_family VALUES (1, 'Bradyrhizobiaceae');
INSERT INTO otu_genus VALUES (1, 'Bradyrhizobium');
INSERT INTO otu_species VALUES (1, 'japonicum');
INSERT INTO environment VALUES (1, 'Soil'), (2, 'Marine');
INSERT INTO vegetation_type VALUES (1, 'Grassland'), (2, 'Forest');
INSERT INTO land_use VALUES (1, 'Agriculture'), (2, 'Conservation');

INSERT INTO import_metadata VALUES ('gen-1', 'v1 pipeline', '2017-06-01');
INSERT INTO imported_file VALUES ('otu.tsv', 'abundance', 1024, 10, 0);
"#;

/// O1 (Bacteria) and O2 (Archaea); samples 101 and 102; O1 counted 5 and 3.
pub const SCENARIO: &str = r#"
INSERT INTO otu (id, code, amplicon_id, kingdom_id, phylum_id) VALUES
    (1, 'O1', 1, 1, 1),
    (2, 'O2', 1, 2, 2);
INSERT INTO sample_context (id, environment_id, ph, depth) VALUES
    (101, 1, 6.1, '0-10cm'),
    (102, 1, 7.4, '10-20cm');
INSERT INTO sample_otu VALUES (101, 1, 5), (102, 1, 3);
"#;

/// Five samples spread over pH and depth, three OTUs.
///
/// | sample | env    | ph   | depth     | pH 5-7 | depth has 10cm |
/// |--------|--------|------|-----------|--------|----------------|
/// | 1      | Soil   | 6.0  | 0-10cm    | yes    | yes            |
/// | 2      | Soil   | 6.5  | 20-30cm   | yes    | no             |
/// | 3      | Soil   | 8.0  | 10cm-20cm | no     | yes            |
/// | 4      | Marine | 8.5  | 30-40cm   | no     | no             |
/// | 5      | Marine | NULL | NULL      | no     | no             |
///
/// OTU 1 (Bacteria, fully classified) occurs everywhere, OTU 2 (Archaea)
/// only in sample 4, OTU 3 (Bacteria/Firmicutes, 18S) in samples 2 and 3.
pub const CONTEXTUAL: &str = r#"
INSERT INTO otu VALUES
    (1, 'OTU-A', 1, 1, 1, 1, 1, 1, 1, 1),
    (2, 'OTU-B', 1, 2, 2, NULL, NULL, NULL, NULL, NULL),
    (3, 'OTU-C', 2, 1, 3, 2, NULL, NULL, NULL, NULL);
INSERT INTO sample_context VALUES
    (1, 1, 6.0, '0-10cm', '2016-03-01', -35.1, 149.2, '', 1, 1, 1),
    (2, 1, 6.5, '20-30cm', '2016-04-11', -35.2, 149.3, '', 2, 1, NULL),
    (3, 1, 8.0, '10cm-20cm', '2017-01-20', -35.3, 149.4, '', NULL, 2, NULL),
    (4, 2, 8.5, '30-40cm', NULL, -20.0, 150.0, '', NULL, NULL, NULL),
    (5, 2, NULL, NULL, NULL, NULL, NULL, '', NULL, NULL, NULL);
INSERT INTO sample_otu VALUES
    (1, 1, 10), (2, 1, 20), (3, 1, 30), (4, 1, 40), (5, 1, 50),
    (4, 2, 7),
    (2, 3, 2), (3, 3, 4);
"#;

pub struct Fixture {
    _dir: TempDir,
    pub path: Utf8PathBuf,
}

impl Fixture {
    pub fn new(data: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("otu.sqlite3")).unwrap();
        let conn = Connection::open(path.as_std_path()).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute_batch(data).unwrap();
        Self { _dir: dir, path }
    }

    pub fn scenario() -> Self {
        Self::new(SCENARIO)
    }

    pub fn contextual() -> Self {
        Self::new(CONTEXTUAL)
    }

    pub fn database(&self) -> Database {
        Database::new(self.path.clone())
    }

    /// Read-write handle for tests that change the dataset under a context.
    pub fn writer(&self) -> Connection {
        Connection::open(self.path.as_std_path()).unwrap()
    }

    pub fn context_with(&self, cache: Arc<dyn ResultCache>) -> QueryContext {
        QueryContext::load(self.database(), cache, SampleSchema::default()).unwrap()
    }

    pub fn context(&self) -> QueryContext {
        self.context_with(Arc::new(NoCache))
    }
}
