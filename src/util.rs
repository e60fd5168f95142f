//! File helpers for evaluation and module loading

use std::fs;
use std::io;
use std::path::Path;

/// Read a whole file as text; a missing file yields `None`
pub fn read_file(path: impl AsRef<Path>) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Canonical URL of a module name
///
/// Names that already carry a scheme are kept; anything else is treated as
/// a path and becomes a `file://` URL of its absolute form.
pub fn to_uri(name: &str) -> String {
    if name.contains("://") {
        return name.to_string();
    }
    let absolute = std::path::absolute(name).unwrap_or_else(|_| Path::new(name).to_path_buf());
    let path = absolute.to_string_lossy().replace('\\', "/");
    if path.starts_with('/') {
        format!("file://{}", path)
    } else {
        // Drive-letter paths
        format!("file:///{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"answer\": 42}}").unwrap();
        assert_eq!(
            read_file(file.path()).unwrap().as_deref(),
            Some("{\"answer\": 42}")
        );
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_file(dir.path().join("missing.json")).unwrap(), None);
    }

    #[test]
    fn test_to_uri() {
        assert_eq!(to_uri("https://example.com/a.json"), "https://example.com/a.json");
        let uri = to_uri("data/config.json");
        assert!(uri.starts_with("file:///"));
        assert!(uri.ends_with("/data/config.json"));
    }
}
