//! Key/value text format used by manifest files
//!
//! ```text
//! Filetype: Flipper Pod Manifest
//! Version: 1
//! # comment
//! Name: sensors
//! ```
//!
//! The first two entries form the header. Every other line is `Key: Value`,
//! split at the first colon. When a key repeats, the first occurrence wins.

use std::path::{Path, PathBuf};
use crate::{Error, Result};

const FILETYPE_KEY: &str = "Filetype";
const VERSION_KEY: &str = "Version";

#[derive(Debug, Clone)]
pub struct KeyValueFile {
    path: PathBuf,
    filetype: String,
    version: u32,
    entries: Vec<(String, String)>,
}

impl KeyValueFile {
    pub fn parse(path: impl AsRef<Path>, text: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                Error::manifest(&path, format!("line {}: expected 'Key: Value'", lineno + 1))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::manifest(&path, format!("line {}: empty key", lineno + 1)));
            }
            entries.push((key.to_string(), value.trim().to_string()));
        }

        let mut header = entries.iter();
        let filetype = match header.next() {
            Some((k, v)) if k == FILETYPE_KEY => v.clone(),
            _ => return Err(Error::manifest(&path, "missing Filetype header")),
        };
        let version = match header.next() {
            Some((k, v)) if k == VERSION_KEY => v
                .parse()
                .map_err(|_| Error::manifest(&path, format!("invalid Version '{}'", v)))?,
            _ => return Err(Error::manifest(&path, "missing Version header")),
        };
        entries.drain(..2);

        Ok(Self {
            path,
            filetype,
            version,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File type tag and format version
    pub fn read_header(&self) -> (&str, u32) {
        (&self.filetype, self.version)
    }

    pub fn read_string(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Read an unsigned field; a present but non-numeric value is an error
    pub fn read_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.read_string(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| {
                Error::manifest(
                    &self.path,
                    format!("field {} is not an unsigned integer: '{}'", key, value),
                )
            }),
        }
    }

    pub fn read_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.read_u32(key)?.map(|v| v != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Filetype: Flipper Pod Manifest\n\
                          Version: 1\n\
                          # sensors pod\n\
                          \n\
                          Name: sensors\n\
                          Image0: /ext/apps/Tools/temp.fap\n\
                          Memory0: 4096\n\
                          Memory0: 9999\n";

    #[test]
    fn test_parse_header_and_entries() {
        let file = KeyValueFile::parse("pod.txt", SAMPLE).unwrap();
        assert_eq!(file.read_header(), ("Flipper Pod Manifest", 1));
        assert_eq!(file.read_string("Name"), Some("sensors"));
        assert_eq!(file.read_string("Image0"), Some("/ext/apps/Tools/temp.fap"));
        assert_eq!(file.read_u32("Memory0").unwrap(), Some(4096));
        assert_eq!(file.read_string("Missing"), None);
    }

    #[test]
    fn test_header_is_not_an_entry() {
        let file = KeyValueFile::parse("pod.txt", SAMPLE).unwrap();
        assert_eq!(file.read_string("Filetype"), None);
    }

    #[test]
    fn test_missing_header() {
        let err = KeyValueFile::parse("pod.txt", "Name: sensors\n").unwrap_err();
        assert!(err.to_string().contains("Filetype"));

        let err = KeyValueFile::parse("pod.txt", "Filetype: x\nName: y\n").unwrap_err();
        assert!(err.to_string().contains("Version"));
    }

    #[test]
    fn test_malformed_lines() {
        let text = "Filetype: x\nVersion: 1\nno colon here\n";
        assert!(KeyValueFile::parse("pod.txt", text).is_err());
        assert!(KeyValueFile::parse("pod.txt", "Filetype: x\nVersion: one\n").is_err());

        let file = KeyValueFile::parse("pod.txt", "Filetype: x\nVersion: 1\nCPU0: lots\n").unwrap();
        assert!(file.read_u32("CPU0").is_err());
    }

    #[test]
    fn test_read_bool() {
        let file = KeyValueFile::parse("pod.txt", "Filetype: x\nVersion: 1\nA: 0\nB: 1\n").unwrap();
        assert_eq!(file.read_bool("A").unwrap(), Some(false));
        assert_eq!(file.read_bool("B").unwrap(), Some(true));
        assert_eq!(file.read_bool("C").unwrap(), None);
    }
}
