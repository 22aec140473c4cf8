//! `moba check` - validate the configuration and the collaborators.
//!
//! Configuration errors, a missing or unparsable catalog and an unopenable
//! database are errors. Catalog entries that name tables the database does
//! not have are warnings.

use super::LoadedConfig;
use anyhow::Result;
use moba_adapter_sqlite::{SqliteDatabase, SqliteOptions};
use moba_core::{Catalog, Database};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    pub category: &'static str,
    pub message: String,
}

impl CheckFinding {
    fn new(severity: Severity, category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CheckResults {
    pub findings: Vec<CheckFinding>,
}

impl CheckResults {
    fn push(&mut self, finding: CheckFinding) {
        self.findings.push(finding);
    }

    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }
}

pub async fn run(loaded: LoadedConfig) -> Result<()> {
    let results = check(&loaded).await;

    for finding in &results.findings {
        println!("[{}] {}: {}", finding.severity, finding.category, finding.message);
    }
    println!(
        "\n{} error(s), {} warning(s)",
        results.error_count(),
        results.warning_count()
    );

    if results.error_count() > 0 {
        anyhow::bail!("check failed with {} error(s)", results.error_count());
    }
    Ok(())
}

pub async fn check(loaded: &LoadedConfig) -> CheckResults {
    let mut results = CheckResults::default();
    results.push(CheckFinding::new(
        Severity::Info,
        "config",
        format!(
            "transport {} on {}",
            loaded.config.transport.kind,
            loaded.config.transport.bind_addr()
        ),
    ));

    let metadata_path = loaded.metadata_path();
    let catalog = match Catalog::load(&metadata_path) {
        Ok(catalog) => {
            results.push(CheckFinding::new(
                Severity::Info,
                "metadata",
                format!(
                    "{} describes {} table(s)",
                    metadata_path.display(),
                    catalog.tables.len()
                ),
            ));
            Some(catalog)
        }
        Err(e) => {
            results.push(CheckFinding::new(Severity::Error, "metadata", e.to_string()));
            None
        }
    };

    let database_path = loaded.database_path();
    let options = SqliteOptions::from(&loaded.config.database);
    let tables = match SqliteDatabase::open(&database_path, options).await {
        Ok(db) => match db.list_tables().await {
            Ok(tables) => {
                results.push(CheckFinding::new(
                    Severity::Info,
                    "database",
                    format!("{} has {} table(s)", database_path.display(), tables.len()),
                ));
                Some(tables)
            }
            Err(e) => {
                results.push(CheckFinding::new(Severity::Error, "database", e.to_string()));
                None
            }
        },
        Err(e) => {
            results.push(CheckFinding::new(Severity::Error, "database", e.to_string()));
            None
        }
    };

    if let (Some(catalog), Some(tables)) = (&catalog, &tables) {
        for finding in cross_check(catalog, tables) {
            results.push(finding);
        }
    }
    results
}

/// Compare catalog entries with the tables the database actually has.
fn cross_check(catalog: &Catalog, tables: &[String]) -> Vec<CheckFinding> {
    let present: BTreeSet<&str> = tables.iter().map(String::as_str).collect();
    let mut findings = Vec::new();
    for name in catalog.table_names() {
        if !present.contains(name) {
            findings.push(CheckFinding::new(
                Severity::Warning,
                "catalog",
                format!("catalog describes table '{}' which the database does not have", name),
            ));
        }
    }
    for name in &present {
        if catalog.table(name).is_none() {
            findings.push(CheckFinding::new(
                Severity::Info,
                "catalog",
                format!("table '{}' has no catalog entry", name),
            ));
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use moba_core::{MobaConfig, TableMetadata};
    use std::fs;

    #[test]
    fn test_cross_check() {
        let mut catalog = Catalog::default();
        catalog.tables.insert("users".into(), TableMetadata::default());
        catalog.tables.insert("ghost".into(), TableMetadata::default());

        let findings = cross_check(&catalog, &["users".to_string(), "orders".to_string()]);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert!(findings[0].message.contains("ghost"));
        assert_eq!(findings[1].severity, Severity::Info);
        assert!(findings[1].message.contains("orders"));
    }

    #[tokio::test]
    async fn test_check_reports_missing_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("metadata.json"), "{}").unwrap();

        let mut config = MobaConfig::default();
        config.metadata.path = "metadata.json".into();
        config.database.path = "missing.db".into();
        let loaded = LoadedConfig {
            config,
            base_dir: dir.path().to_path_buf(),
        };

        let results = check(&loaded).await;
        assert_eq!(results.error_count(), 1);
        assert!(
            results
                .findings
                .iter()
                .any(|f| f.severity == Severity::Error && f.category == "database")
        );
    }
}
