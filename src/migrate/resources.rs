use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Lists and reads text resources by path. Paths use `/` separators and
/// start with the root they were found under.
pub trait ResourceLoader: Send + Sync {
    /// Every resource below `root`, recursively, sorted.
    fn walk(&self, root: &str) -> Vec<String>;

    fn utf8(&self, path: &str) -> Option<String>;
}

/// Resources on disk, relative to a base directory.
#[derive(Debug, Clone)]
pub struct FilesystemResourceLoader {
    base: PathBuf,
}

impl FilesystemResourceLoader {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "cannot list migration resources");
                }
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = format!("{prefix}/{name}");
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => self.collect(&entry.path(), &path, out),
                Ok(kind) if kind.is_file() => out.push(path),
                _ => {}
            }
        }
    }
}

impl ResourceLoader for FilesystemResourceLoader {
    fn walk(&self, root: &str) -> Vec<String> {
        let root = root.trim_end_matches('/');
        let mut out = Vec::new();
        self.collect(&self.base.join(root), root, &mut out);
        out.sort();
        out
    }

    fn utf8(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.base.join(path)).ok()
    }
}

/// Resources held in memory, for embedded migrations and tests.
#[derive(Debug, Default)]
pub struct MemoryResourceLoader {
    files: RwLock<BTreeMap<String, String>>,
}

impl MemoryResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<String>, content: impl Into<String>) {
        self.files.write().insert(path.into(), content.into());
    }

    pub fn with(self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.put(path, content);
        self
    }
}

impl ResourceLoader for MemoryResourceLoader {
    fn walk(&self, root: &str) -> Vec<String> {
        let prefix = format!("{}/", root.trim_end_matches('/'));
        self.files
            .read()
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn utf8(&self, path: &str) -> Option<String> {
        self.files.read().get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::{FilesystemResourceLoader, MemoryResourceLoader, ResourceLoader};
    use tempfile::tempdir;

    #[test]
    fn filesystem_walk_is_recursive_and_rooted() {
        let dir = tempdir().expect("temp");
        let nested = dir.path().join("migrations/ns");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("migrations/v1__a.sql"), "CREATE TABLE a (id INTEGER);")
            .expect("write");
        std::fs::write(nested.join("v1__c.sql"), "CREATE TABLE c (id INTEGER);").expect("write");

        let loader = FilesystemResourceLoader::new(dir.path());
        assert_eq!(
            loader.walk("migrations"),
            vec!["migrations/ns/v1__c.sql".to_string(), "migrations/v1__a.sql".to_string()]
        );
        assert_eq!(
            loader.utf8("migrations/v1__a.sql").as_deref(),
            Some("CREATE TABLE a (id INTEGER);")
        );
        assert!(loader.walk("absent").is_empty());
    }

    #[test]
    fn memory_walk_matches_whole_directory_names() {
        let loader = MemoryResourceLoader::new()
            .with("migrations/v1__a.sql", "a")
            .with("migrations2/v1__b.sql", "b");
        assert_eq!(loader.walk("migrations"), vec!["migrations/v1__a.sql".to_string()]);
        assert_eq!(loader.utf8("migrations2/v1__b.sql").as_deref(), Some("b"));
    }
}
