//! Extension whitelist and MIME lookup.

use std::collections::HashMap;
use std::path::Path;

use crate::config::FilesConfig;

/// Immutable mapping from lower-cased extension to content type.
///
/// Doubles as the whitelist: a name without an extension, or with one that
/// is not listed, has no content type and is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPolicy {
    types: HashMap<String, String>,
}

impl ExtensionPolicy {
    /// Build from `(extension, content type)` pairs. Extensions may carry a
    /// leading dot; they are stored lower-cased without it.
    pub fn new<I, E, M>(entries: I) -> Self
    where
        I: IntoIterator<Item = (E, M)>,
        E: AsRef<str>,
        M: Into<String>,
    {
        let types = entries
            .into_iter()
            .map(|(ext, mime)| {
                let ext = ext.as_ref();
                (ext.strip_prefix('.').unwrap_or(ext).to_ascii_lowercase(), mime.into())
            })
            .collect();
        Self { types }
    }

    pub fn from_config(config: &FilesConfig) -> Self {
        Self::new(config.extensions.iter().map(|(ext, mime)| (ext, mime.clone())))
    }

    /// Content type for the extension of `name` (a path or bare filename).
    ///
    /// A leading dot marks a hidden name, not an extension: `.txt` and
    /// `/dir/.html` have no content type, so dotfiles are neither served nor
    /// accepted as uploads.
    pub fn content_type(&self, name: &str) -> Option<&str> {
        if name.ends_with('/') {
            return None;
        }
        let ext = Path::new(name).extension()?.to_str()?;
        self.types.get(&ext.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn allows(&self, name: &str) -> bool {
        self.content_type(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for ExtensionPolicy {
    fn default() -> Self {
        Self::from_config(&FilesConfig::default())
    }
}
