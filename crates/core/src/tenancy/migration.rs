//! Versioned migration scripts.
//!
//! A [`MigrationSet`] is validated once, when it is built, and is immutable
//! afterwards. Versions start at 1 and are contiguous, so a set with a gap
//! or a duplicate never reaches the runner.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::tenancy::error::TenancyError;

/// One versioned DDL script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    version: u32,
    name: String,
    sql: String,
    checksum: String,
}

impl MigrationScript {
    /// Creates a script and computes its checksum.
    #[must_use]
    pub fn new(version: u32, name: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let checksum = checksum(&sql);
        Self {
            version,
            name: name.into(),
            sql,
            checksum,
        }
    }

    /// Version number.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// DDL body, executed verbatim.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Hex SHA-256 of the body.
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

/// Hex SHA-256 of a script body.
#[must_use]
pub fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// An ordered, validated, immutable sequence of migration scripts.
///
/// Cloning is cheap; the scripts are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSet {
    scripts: Arc<[MigrationScript]>,
}

impl MigrationSet {
    /// Builds a set, sorting by version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMigrationSet` if a version is duplicated, the set
    /// does not start at 1, or there is a gap between versions.
    pub fn new(mut scripts: Vec<MigrationScript>) -> Result<Self, TenancyError> {
        scripts.sort_by_key(MigrationScript::version);

        let mut expected = 1;
        for script in &scripts {
            if script.version != expected {
                let reason = if expected > 1 && script.version == expected - 1 {
                    format!("duplicate version {}", script.version)
                } else {
                    format!("expected version {expected}, found {}", script.version)
                };
                return Err(TenancyError::InvalidMigrationSet(reason));
            }
            expected += 1;
        }

        Ok(Self {
            scripts: scripts.into(),
        })
    }

    /// A set with no scripts.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            scripts: Arc::from(Vec::new()),
        }
    }

    /// Loads every `NNNN_name.sql` file in a directory.
    ///
    /// Meant for process start-up; the resulting set is then passed around by
    /// value. Files without the `.sql` extension are ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMigrationSet` if the directory cannot be read, a file
    /// name has no numeric version prefix, or the versions fail validation.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, TenancyError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            TenancyError::InvalidMigrationSet(format!("cannot read {}: {e}", dir.display()))
        })?;

        let mut scripts = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| TenancyError::InvalidMigrationSet(e.to_string()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            let (version, name) = parse_file_stem(stem).ok_or_else(|| {
                TenancyError::InvalidMigrationSet(format!(
                    "{} does not match NNNN_name.sql",
                    path.display()
                ))
            })?;
            let sql = std::fs::read_to_string(&path).map_err(|e| {
                TenancyError::InvalidMigrationSet(format!("cannot read {}: {e}", path.display()))
            })?;
            scripts.push(MigrationScript::new(version, name, sql));
        }

        Self::new(scripts)
    }

    /// Number of scripts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    /// Returns true if the set has no scripts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Highest version, or 0 for an empty set.
    #[must_use]
    pub fn latest_version(&self) -> u32 {
        self.scripts.last().map_or(0, MigrationScript::version)
    }

    /// Looks up a script by version.
    #[must_use]
    pub fn get(&self, version: u32) -> Option<&MigrationScript> {
        let index = usize::try_from(version).ok()?.checked_sub(1)?;
        self.scripts.get(index)
    }

    /// Scripts with a version greater than `version`, ascending.
    #[must_use]
    pub fn after(&self, version: u32) -> &[MigrationScript] {
        let start = usize::try_from(version)
            .unwrap_or(usize::MAX)
            .min(self.scripts.len());
        &self.scripts[start..]
    }

    /// Iterates over the scripts in ascending version order.
    pub fn iter(&self) -> impl Iterator<Item = &MigrationScript> {
        self.scripts.iter()
    }
}

impl Default for MigrationSet {
    fn default() -> Self {
        Self::empty()
    }
}

/// Splits `0003_add_contacts` into `(3, "add_contacts")`.
fn parse_file_stem(stem: &str) -> Option<(u32, String)> {
    let (digits, name) = stem.split_once('_').unwrap_or((stem, ""));
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version = digits.parse().ok()?;
    Some((version, name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(version: u32) -> MigrationScript {
        MigrationScript::new(
            version,
            format!("step_{version}"),
            format!("CREATE TABLE t{version} (id INT);"),
        )
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let s = script(1);
        assert_eq!(s.checksum().len(), 64);
        assert_eq!(s.checksum(), checksum(s.sql()));
    }

    #[test]
    fn test_set_sorts_and_accepts_contiguous_versions() {
        let set = MigrationSet::new(vec![script(2), script(1), script(3)]).unwrap();
        let versions: Vec<u32> = set.iter().map(MigrationScript::version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(set.latest_version(), 3);
        assert_eq!(set.get(2).map(MigrationScript::name), Some("step_2"));
        assert!(set.get(0).is_none());
        assert!(set.get(4).is_none());
    }

    #[test]
    fn test_set_rejects_gap() {
        let err = MigrationSet::new(vec![script(1), script(2), script(4)]).unwrap_err();
        assert_eq!(
            err,
            TenancyError::InvalidMigrationSet("expected version 3, found 4".into())
        );
    }

    #[test]
    fn test_set_rejects_duplicate() {
        let err = MigrationSet::new(vec![script(1), script(2), script(2)]).unwrap_err();
        assert_eq!(
            err,
            TenancyError::InvalidMigrationSet("duplicate version 2".into())
        );
    }

    #[test]
    fn test_set_must_start_at_one() {
        assert!(MigrationSet::new(vec![script(0)]).is_err());
        assert!(MigrationSet::new(vec![script(2), script(3)]).is_err());
    }

    #[test]
    fn test_empty_set() {
        let set = MigrationSet::new(Vec::new()).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.latest_version(), 0);
        assert!(set.after(0).is_empty());
        assert_eq!(set, MigrationSet::default());
    }

    #[test]
    fn test_after_returns_pending_tail() {
        let set = MigrationSet::new((1..=5).map(script).collect()).unwrap();
        let tail: Vec<u32> = set.after(2).iter().map(MigrationScript::version).collect();
        assert_eq!(tail, vec![3, 4, 5]);
        assert!(set.after(5).is_empty());
        assert!(set.after(99).is_empty());
    }

    #[test]
    fn test_parse_file_stem() {
        assert_eq!(parse_file_stem("0003_add_contacts"), Some((3, "add_contacts".into())));
        assert_eq!(parse_file_stem("12"), Some((12, String::new())));
        assert_eq!(parse_file_stem("init_accounts"), None);
        assert_eq!(parse_file_stem("_x"), None);
    }

    #[test]
    fn test_load_dir() {
        let dir = std::env::temp_dir().join(format!("tessera-migrations-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("0002_contacts.sql"), "CREATE TABLE contacts (id INT);").unwrap();
        std::fs::write(dir.join("0001_accounts.sql"), "CREATE TABLE accounts (id INT);").unwrap();
        std::fs::write(dir.join("README.md"), "ignored").unwrap();

        let set = MigrationSet::load_dir(&dir).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1).unwrap().name(), "accounts");
        assert_eq!(set.get(2).unwrap().sql(), "CREATE TABLE contacts (id INT);");

        std::fs::write(dir.join("0004_gap.sql"), "SELECT 1;").unwrap();
        assert!(MigrationSet::load_dir(&dir).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_dir_missing_directory() {
        let err = MigrationSet::load_dir("/definitely/not/here").unwrap_err();
        assert!(matches!(err, TenancyError::InvalidMigrationSet(_)));
    }
}
