use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info};

use crate::database_ops::db::{ConnectionPool, DbConfig};
use crate::importer::mapping::ImportMapping;
use crate::importer::preflight::preflight;
use crate::importer::run::{ImportJob, ImportSummary};
use crate::importer::source::open_records;
use crate::util::env as env_util;

/// `mapping.json=data.csv`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStep {
    pub mapping: PathBuf,
    pub data: PathBuf,
}

impl FromStr for ImportStep {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (mapping, data) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("expected <mapping.json>=<data.csv>, got {raw}"))?;
        if mapping.trim().is_empty() || data.trim().is_empty() {
            bail!("expected <mapping.json>=<data.csv>, got {raw}");
        }
        Ok(Self {
            mapping: PathBuf::from(mapping.trim()),
            data: PathBuf::from(data.trim()),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportConfig {
    /// Database file; falls back to IMPORT_DB_PATH.
    pub db_path: Option<PathBuf>,
    /// Steps run in order; a failing step stops the run.
    pub steps: Vec<ImportStep>,
    /// Rows per statement for every step, over mapping and env settings.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckConfig {
    pub db_path: Option<PathBuf>,
    pub mappings: Vec<PathBuf>,
}

fn db_config(path: Option<PathBuf>) -> Result<DbConfig> {
    match path {
        Some(path) => Ok(DbConfig::new(path).with_env_overrides()),
        None => DbConfig::from_env().context("no --db given and IMPORT_DB_PATH is not set"),
    }
}

pub fn run(cfg: ImportConfig) -> Result<Vec<ImportSummary>> {
    env_util::init_env();
    if cfg.steps.is_empty() {
        bail!("no import steps given");
    }

    // Every mapping is parsed before anything is written.
    let mut steps = Vec::with_capacity(cfg.steps.len());
    for step in &cfg.steps {
        steps.push((ImportMapping::load(&step.mapping)?, step));
    }

    let pool = ConnectionPool::new(db_config(cfg.db_path)?);
    let writer = Rc::new(pool.write()?);
    let reader = pool.read()?;

    let mut summaries = Vec::with_capacity(steps.len());
    for (mapping, step) in steps {
        preflight(&reader, &mapping)
            .with_context(|| format!("step {}", step.mapping.display()))?;

        let mut records = open_records(&step.data)?;
        let job = ImportJob::prepare(Rc::clone(&writer), mapping, cfg.limit)?;
        let summary = match job.run(records.by_ref()) {
            Ok(summary) => summary,
            Err(err) => {
                error!(
                    target: "import",
                    mapping = %step.mapping.display(),
                    data = %step.data.display(),
                    error = %format!("{err:#}"),
                    "import step failed"
                );
                return Err(err.context(format!("importing {}", step.data.display())));
            }
        };
        info!(
            target: "import",
            data = %step.data.display(),
            skipped_rows = records.skipped(),
            "step complete"
        );
        summaries.push(summary);
    }
    Ok(summaries)
}

pub fn check(cfg: CheckConfig) -> Result<()> {
    env_util::init_env();
    let pool = ConnectionPool::new(db_config(cfg.db_path)?);
    let reader = pool.read()?;

    let mut failed = 0;
    for path in &cfg.mappings {
        let outcome = ImportMapping::load(path).and_then(|mapping| preflight(&reader, &mapping));
        match outcome {
            Ok(()) => info!(target: "import", mapping = %path.display(), "mapping ok"),
            Err(err) => {
                failed += 1;
                error!(
                    target: "import",
                    mapping = %path.display(),
                    error = %format!("{err:#}"),
                    "mapping check failed"
                );
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} mappings failed the check", cfg.mappings.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::db::Db;
    use crate::database_ops::fixtures::temp_db_path;

    #[test]
    fn parses_steps() {
        let step: ImportStep = "maps/product.json=data/product.csv".parse().unwrap();
        assert_eq!(step.mapping, PathBuf::from("maps/product.json"));
        assert_eq!(step.data, PathBuf::from("data/product.csv"));
        assert!("product.json".parse::<ImportStep>().is_err());
        assert!("=data.csv".parse::<ImportStep>().is_err());
    }

    #[test]
    fn runs_steps_against_a_database_file() {
        let db_path = temp_db_path("cli");
        {
            let db = Db::open(&db_path).unwrap();
            db.execute_batch(
                "CREATE TABLE brand (id INTEGER PRIMARY KEY, code TEXT UNIQUE, name TEXT);
                 CREATE TABLE product (id INTEGER PRIMARY KEY, sku TEXT UNIQUE, brand_id INTEGER);",
            )
            .unwrap();
        }

        let dir = std::env::temp_dir();
        let stamp = std::process::id();
        let brand_map = dir.join(format!("bulk-import-brand-{stamp}.json"));
        let brand_csv = dir.join(format!("bulk-import-brand-{stamp}.csv"));
        let product_map = dir.join(format!("bulk-import-product-{stamp}.json"));
        let product_csv = dir.join(format!("bulk-import-product-{stamp}.csv"));

        std::fs::write(
            &brand_map,
            r#"{"tables": [{"table": "brand", "columns": {
                "code": {"from": "field", "field": "code"},
                "name": {"from": "field", "field": "name"}},
              "on_duplicate": ["name"]}]}"#,
        )
        .unwrap();
        std::fs::write(&brand_csv, "code,name\nacme,Acme\nglobex,Globex\n").unwrap();
        std::fs::write(
            &product_map,
            r#"{"tables": [{"table": "product", "columns": {
                "sku": {"from": "field", "field": "sku"},
                "brand_id": {"from": "lookup", "resolver": "brands", "field": "brand"}}}],
              "resolvers": {"brands": {"kind": "single", "table": "brand", "search": "code",
                                       "target": "id"}}}"#,
        )
        .unwrap();
        std::fs::write(&product_csv, "sku,brand\nP-1,acme\nP-2,initech\nP-3,globex\n").unwrap();

        let summaries = run(ImportConfig {
            db_path: Some(db_path.clone()),
            steps: vec![
                ImportStep {
                    mapping: brand_map.clone(),
                    data: brand_csv.clone(),
                },
                ImportStep {
                    mapping: product_map.clone(),
                    data: product_csv.clone(),
                },
            ],
            limit: None,
        })
        .unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].total().rows_written, 2);
        assert_eq!(summaries[1].total().rows_dropped, 1);

        check(CheckConfig {
            db_path: Some(db_path.clone()),
            mappings: vec![brand_map.clone(), product_map.clone()],
        })
        .unwrap();

        let db = Db::open(&db_path).unwrap();
        let rows = db
            .query_rows(
                "SELECT p.sku, b.code FROM product p JOIN brand b ON b.id = p.brand_id \
                 ORDER BY p.sku",
                &[],
                2,
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1].as_key().as_deref(), Some("globex"));

        for path in [brand_map, brand_csv, product_map, product_csv, db_path] {
            let _ = std::fs::remove_file(path);
        }
    }
}
