use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::DbResult;

/// File name of the persisted catalog inside the binlog directory.
pub const CATALOG_FILE_NAME: &str = "BINLOG_INDEX";

/// Ordered list of segment base names, oldest first.
///
/// The last entry always names the segment currently open for writing.
/// Persisted as plain text, one name per line; the whole file is rewritten
/// on every save. Catalogs stay small (one entry per rotation), so lookups
/// are linear scans.
#[derive(Debug, Clone, Default)]
pub struct SegmentCatalog {
    names: Vec<String>,
}

impl SegmentCatalog {
    /// Load a catalog; a missing file is an empty catalog, not an error.
    pub fn load<P: AsRef<Path>>(path: P) -> DbResult<SegmentCatalog> {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SegmentCatalog::default())
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let name = line.trim();
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
        Ok(SegmentCatalog { names })
    }

    /// Rewrite the whole catalog file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> DbResult<()> {
        let mut file = File::create(path.as_ref())?;
        for name in &self.names {
            writeln!(file, "{}", name)?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Append a name in memory; the caller persists separately.
    pub fn push(&mut self, name: String) {
        self.names.push(name);
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|s| s.as_str())
    }

    pub fn last(&self) -> Option<&str> {
        self.names.last().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CATALOG_FILE_NAME);

        let mut catalog = SegmentCatalog::default();
        catalog.push("20240101_090000-11-bin".to_string());
        catalog.push("20240101_090500-73-bin".to_string());
        catalog.save(&path).unwrap();

        let loaded = SegmentCatalog::load(&path).unwrap();
        assert_eq!(loaded.names(), catalog.names());
        assert_eq!(loaded.last(), Some("20240101_090500-73-bin"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let catalog = SegmentCatalog::load("/nonexistent/BINLOG_INDEX").unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.len(), 0);
        assert_eq!(catalog.last(), None);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CATALOG_FILE_NAME);
        std::fs::write(&path, "first-bin\n\n  \nsecond-bin\n").unwrap();

        let catalog = SegmentCatalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(0), Some("first-bin"));
        assert_eq!(catalog.get(1), Some("second-bin"));
    }

    #[test]
    fn test_index_of() {
        let mut catalog = SegmentCatalog::default();
        catalog.push("a-bin".to_string());
        catalog.push("b-bin".to_string());

        assert_eq!(catalog.index_of("a-bin"), Some(0));
        assert_eq!(catalog.index_of("b-bin"), Some(1));
        assert_eq!(catalog.index_of("missing-bin"), None);
    }

    #[test]
    fn test_save_overwrites() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CATALOG_FILE_NAME);

        let mut catalog = SegmentCatalog::default();
        catalog.push("only-bin".to_string());
        catalog.save(&path).unwrap();
        catalog.push("later-bin".to_string());
        catalog.save(&path).unwrap();

        let loaded = SegmentCatalog::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
