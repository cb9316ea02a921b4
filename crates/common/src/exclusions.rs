//! # Exclusion Registry
//!
//! Hand-curated (class, field) pairs whose static values are safe for archived
//! objects to alias even though the field is re-initialized every run.
//!
//! The built-in table covers the JDK core library. Additional entries can be
//! merged in from JSON overlay files:
//!
//! ```json
//! { "exclusions": [
//!     { "class": "com/acme/Config", "rationale": "inert_cache", "fields": ["CACHE"] }
//! ] }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Errors from loading exclusion overlays.
#[derive(Debug, thiserror::Error)]
pub enum ExclusionError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid exclusion file {path}: {source}")]
    JsonError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Exclusion entry in {path} has an empty class or field name")]
    EmptyName { path: PathBuf },
}

/// Why an excluded field is safe to alias.
///
/// Documentation only; nothing checks these mechanically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rationale {
    /// Bootstrap code repoints the field into the archived graph before use.
    BootstrapRepointed,
    /// `final` field always assigned the same string literal in `<clinit>`.
    FinalLiteral,
    /// Non-final field assigned a literal once and never changed while dumping.
    InitOnceLiteral,
    /// Cache whose contents never affect observable behavior.
    InertCache,
    /// Documented one-off structural exception.
    Structural,
}

impl Rationale {
    pub fn label(self) -> &'static str {
        match self {
            Rationale::BootstrapRepointed => "bootstrap-repointed",
            Rationale::FinalLiteral => "final-literal",
            Rationale::InitOnceLiteral => "init-once-literal",
            Rationale::InertCache => "inert-cache",
            Rationale::Structural => "structural",
        }
    }
}

/// One excluded field name and the reason it is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedField {
    pub name: String,
    pub rationale: Rationale,
}

// Unfortunately this needs to be maintained by hand. When an archived enum or
// module-graph object starts tripping the verifier, either the library code
// or this table has to change.
//
//  (class, rationale, fields)
static BUILTIN: &[(&str, Rationale, &[&str])] = &[
    ("java/lang/ClassLoader", Rationale::BootstrapRepointed, &["scl"]),
    (
        "java/lang/invoke/InvokerBytecodeGenerator",
        Rationale::FinalLiteral,
        &[
            "DONTINLINE_SIG",
            "FORCEINLINE_SIG",
            "HIDDEN_SIG",
            "INJECTEDPROFILE_SIG",
            "LF_COMPILED_SIG",
        ],
    ),
    (
        "java/lang/Module",
        Rationale::BootstrapRepointed,
        &[
            "ALL_UNNAMED_MODULE",
            "ALL_UNNAMED_MODULE_SET",
            "EVERYONE_MODULE",
            "EVERYONE_SET",
        ],
    ),
    ("java/lang/System", Rationale::BootstrapRepointed, &["bootLayer"]),
    (
        "java/lang/VersionProps",
        Rationale::InitOnceLiteral,
        &["VENDOR_URL_BUG", "VENDOR_URL_VM_BUG", "VENDOR_VERSION"],
    ),
    ("java/net/URL$DefaultFactory", Rationale::FinalLiteral, &["PREFIX"]),
    // Dummy value shared by every HashSet; never compared for identity.
    ("java/util/HashSet", Rationale::Structural, &["PRESENT"]),
    (
        "jdk/internal/loader/BuiltinClassLoader",
        Rationale::BootstrapRepointed,
        &["packageToModule"],
    ),
    (
        "jdk/internal/loader/ClassLoaders",
        Rationale::BootstrapRepointed,
        &["BOOT_LOADER", "APP_LOADER", "PLATFORM_LOADER"],
    ),
    ("jdk/internal/loader/URLClassPath", Rationale::FinalLiteral, &["JAVA_VERSION"]),
    ("jdk/internal/module/Builder", Rationale::InertCache, &["cachedVersion"]),
    (
        "jdk/internal/module/ModuleLoaderMap$Mapper",
        Rationale::BootstrapRepointed,
        &[
            "APP_CLASSLOADER",
            "APP_LOADER_INDEX",
            "PLATFORM_CLASSLOADER",
            "PLATFORM_LOADER_INDEX",
        ],
    ),
    ("jdk/internal/module/ServicesCatalog", Rationale::BootstrapRepointed, &["CLV"]),
    // Points at an empty map.
    ("jdk/internal/reflect/Reflection", Rationale::Structural, &["methodFilterMap"]),
    ("jdk/internal/util/StaticProperty", Rationale::InitOnceLiteral, &["FILE_ENCODING"]),
];

/// JSON form of one overlay entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExclusionRecord {
    pub class: String,
    pub rationale: Rationale,
    pub fields: Vec<String>,
}

// Helper for JSON deserialization of overlay files.
#[derive(Debug, Deserialize)]
pub struct ExclusionFile {
    pub exclusions: Vec<ExclusionRecord>,
}

/// Class internal name → excluded static fields. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionTable {
    entries: BTreeMap<String, Vec<ExcludedField>>,
}

impl ExclusionTable {
    /// A table with no exclusions at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The curated JDK table.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (class, rationale, fields) in BUILTIN {
            table.add(class, *rationale, fields.iter().copied());
        }
        table
    }

    /// Adds `fields` of `class` to the table. Duplicates are harmless.
    pub fn add<'a>(
        &mut self,
        class: &str,
        rationale: Rationale,
        fields: impl IntoIterator<Item = &'a str>,
    ) {
        let set = self.entries.entry(class.to_string()).or_default();
        set.extend(fields.into_iter().map(|name| ExcludedField {
            name: name.to_string(),
            rationale,
        }));
    }

    /// Excluded fields of `class`; `None` means the class has no exclusions.
    pub fn lookup(&self, class: &str) -> Option<&[ExcludedField]> {
        self.entries.get(class).map(Vec::as_slice)
    }

    pub fn is_excluded(&self, class: &str, field: &str) -> bool {
        self.lookup(class)
            .is_some_and(|set| set.iter().any(|f| f.name == field))
    }

    /// Number of classes with at least one exclusion.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ExcludedField])> {
        self.entries.iter().map(|(c, f)| (c.as_str(), f.as_slice()))
    }

    /// Merges one overlay file into the table.
    pub fn merge_file(&mut self, path: &Path) -> Result<usize, ExclusionError> {
        let content = fs::read_to_string(path)?;
        let file: ExclusionFile =
            serde_json::from_str(&content).map_err(|source| ExclusionError::JsonError {
                path: path.to_path_buf(),
                source,
            })?;

        if file
            .exclusions
            .iter()
            .any(|r| r.class.is_empty() || r.fields.iter().any(String::is_empty))
        {
            return Err(ExclusionError::EmptyName {
                path: path.to_path_buf(),
            });
        }

        let mut added = 0;
        for record in &file.exclusions {
            self.add(
                &record.class,
                record.rationale,
                record.fields.iter().map(String::as_str),
            );
            added += record.fields.len();
        }
        Ok(added)
    }

    /// Merges every `.json` file found (recursively) under `root`.
    ///
    /// Files are visited in sorted order so merges are deterministic.
    /// Returns the number of field entries added.
    pub fn merge_dir(&mut self, root: &Path) -> Result<usize, ExclusionError> {
        let mut added = 0;
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().and_then(|s| s.to_str()) == Some("json")
            {
                added += self.merge_file(path)?;
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let table = ExclusionTable::builtin();
        let fields = table.lookup("java/lang/Module").unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ALL_UNNAMED_MODULE",
                "ALL_UNNAMED_MODULE_SET",
                "EVERYONE_MODULE",
                "EVERYONE_SET"
            ]
        );
        assert!(fields
            .iter()
            .all(|f| f.rationale == Rationale::BootstrapRepointed));
    }

    #[test]
    fn test_absent_class_has_no_exclusions() {
        let table = ExclusionTable::builtin();
        assert!(table.lookup("com/acme/Unknown").is_none());
        assert!(!table.is_excluded("com/acme/Unknown", "scl"));
    }

    #[test]
    fn test_is_excluded_is_per_class() {
        let table = ExclusionTable::builtin();
        assert!(table.is_excluded("java/util/HashSet", "PRESENT"));
        assert!(!table.is_excluded("java/util/HashMap", "PRESENT"));
        assert!(!table.is_excluded("java/util/HashSet", "map"));
    }

    #[test]
    fn test_duplicates_are_harmless() {
        let mut table = ExclusionTable::empty();
        table.add("Foo", Rationale::InertCache, ["bar", "bar"]);
        table.add("Foo", Rationale::Structural, ["bar"]);
        assert_eq!(table.len(), 1);
        assert!(table.is_excluded("Foo", "bar"));
    }

    #[test]
    fn test_merge_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("acme");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            nested.join("acme.json"),
            r#"{"exclusions":[{"class":"com/acme/Config","rationale":"inert_cache","fields":["CACHE","LOOKUP"]}]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "not json").unwrap();

        let mut table = ExclusionTable::builtin();
        let before = table.len();
        let added = table.merge_dir(dir.path()).unwrap();

        assert_eq!(added, 2);
        assert_eq!(table.len(), before + 1);
        assert!(table.is_excluded("com/acme/Config", "LOOKUP"));
        assert_eq!(
            table.lookup("com/acme/Config").unwrap()[0].rationale,
            Rationale::InertCache
        );
    }

    #[test]
    fn test_merge_rejects_empty_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(
            &path,
            r#"{"exclusions":[{"class":"","rationale":"structural","fields":["X"]}]}"#,
        )
        .unwrap();

        let mut table = ExclusionTable::empty();
        let err = table.merge_file(&path).unwrap_err();
        assert!(matches!(err, ExclusionError::EmptyName { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_merge_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let mut table = ExclusionTable::empty();
        assert!(matches!(
            table.merge_file(&path),
            Err(ExclusionError::JsonError { .. })
        ));
    }

    #[test]
    fn test_merge_rejects_unknown_rationale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.json");
        fs::write(
            &path,
            r#"{"exclusions":[{"class":"a/b/C","rationale":"cache","fields":["X"]}]}"#,
        )
        .unwrap();

        let mut table = ExclusionTable::empty();
        assert!(matches!(
            table.merge_file(&path),
            Err(ExclusionError::JsonError { .. })
        ));
        assert!(table.is_empty());
    }
}
