//! Script references: where a module lives and how it is imported.

use crate::error::ImportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Supported script languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    /// Rhai embedded scripting language
    Rhai,
    /// Python via PyO3 (requires the `scripting_python` feature at runtime)
    Python,
}

impl ScriptLanguage {
    /// Get the file extension for this language.
    pub fn extension(&self) -> &'static str {
        match self {
            ScriptLanguage::Rhai => "rhai",
            ScriptLanguage::Python => "py",
        }
    }

    /// Detect language from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "rhai" => Some(ScriptLanguage::Rhai),
            "py" => Some(ScriptLanguage::Python),
            _ => None,
        }
    }

    /// Whether a backend for this language was compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            ScriptLanguage::Rhai => true,
            ScriptLanguage::Python => cfg!(feature = "scripting_python"),
        }
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptLanguage::Rhai => f.write_str("Rhai"),
            ScriptLanguage::Python => f.write_str("Python"),
        }
    }
}

/// A script file resolved into the pieces an interpreter import needs.
///
/// Recomputed whenever the script path changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptReference {
    path: PathBuf,
    module_id: String,
    search_dir: PathBuf,
    language: ScriptLanguage,
}

impl ScriptReference {
    /// Derive module identifier, search directory and language from `path`.
    ///
    /// Fails with [`ImportError::PathInvalid`] if the path is empty, has no
    /// usable file stem, the stem is not a valid identifier, or the extension
    /// does not name a supported language.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let invalid = |reason: &str| ImportError::PathInvalid {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        if path.as_os_str().is_empty() {
            return Err(invalid("path is empty"));
        }

        let module_id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| invalid("no file name"))?;
        if !is_identifier(module_id) {
            return Err(invalid("file name is not a valid module identifier"));
        }

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let language = ScriptLanguage::from_extension(ext)
            .ok_or_else(|| invalid(&format!("unsupported script extension '{ext}'")))?;

        let search_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            path: path.to_path_buf(),
            module_id: module_id.to_string(),
            search_dir,
            language,
        })
    }

    /// Full path to the script file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module identifier (file name without extension).
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Directory added to the interpreter's module search path.
    pub fn search_dir(&self) -> &Path {
        &self.search_dir
    }

    /// Language inferred from the extension.
    pub fn language(&self) -> ScriptLanguage {
        self.language
    }
}

/// ASCII identifier check shared by module names and class names.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
