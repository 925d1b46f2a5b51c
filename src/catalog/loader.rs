use crate::catalog::schema::{Catalog, RawCatalog, ValidationError};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum CatalogError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Json {
        path: Option<PathBuf>,
        source: serde_json::Error,
    },
    Validation {
        path: Option<PathBuf>,
        source: ValidationError,
    },
}

impl CatalogError {
    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            CatalogError::Io { .. } => self,
            CatalogError::Json { path: None, source } => CatalogError::Json {
                path: Some(path),
                source,
            },
            CatalogError::Validation { path: None, source } => CatalogError::Validation {
                path: Some(path),
                source,
            },
            other => other,
        }
    }

    /// Validation issues, if this error came from rule validation.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            CatalogError::Validation { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io { path, source } => {
                write!(
                    f,
                    "failed to read pattern catalog from {}: {}",
                    path.display(),
                    source
                )
            }
            CatalogError::Json { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse pattern catalog JSON ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse pattern catalog JSON: {}", source),
            },
            CatalogError::Validation { path, source } => match path {
                Some(path) => write!(f, "invalid pattern catalog ({}): {}", path.display(), source),
                None => write!(f, "invalid pattern catalog: {}", source),
            },
        }
    }
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CatalogError::Io { source, .. } => Some(source),
            CatalogError::Json { source, .. } => Some(source),
            CatalogError::Validation { source, .. } => Some(source),
        }
    }
}

/// Load a catalog from a JSON string. All-or-nothing.
pub fn load_from_str(input: &str) -> Result<Catalog, CatalogError> {
    load_from_slice(input.as_bytes())
}

/// Load a catalog from raw JSON bytes, e.g. an embedded resource.
pub fn load_from_slice(input: &[u8]) -> Result<Catalog, CatalogError> {
    let raw: RawCatalog = serde_json::from_slice(input)
        .map_err(|source| CatalogError::Json { path: None, source })?;
    let catalog = raw
        .validate()
        .map_err(|source| CatalogError::Validation { path: None, source })?;
    log::debug!("loaded pattern catalog with {} rules", catalog.len());
    Ok(catalog)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Catalog, CatalogError> {
    let path = path.as_ref();
    let contents = fs::read(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_slice(&contents).map_err(|error| error.with_path(path))
}
