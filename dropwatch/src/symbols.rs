//! Persistent cache of the backend's symbol list.
//!
//! The list rarely changes, so it is fetched once, written to disk under a
//! fixed key and reused across runs until explicitly invalidated.

use crate::{api::AnalysisApi, error::DropwatchError};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// File name the symbol list is stored under.
pub const SYMBOL_CACHE_KEY: &str = "usdt_pairs.json";

/// On-disk symbol list cache.
#[derive(Debug, Clone)]
pub struct SymbolCache {
    path: PathBuf,
}

impl SymbolCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SYMBOL_CACHE_KEY),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached symbols, or `None` if nothing usable is stored.
    pub fn load(&self) -> Result<Option<Vec<String>>, DropwatchError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(symbols) if !symbols.is_empty() => Ok(Some(symbols)),
            Ok(_) => Ok(None),
            Err(error) => {
                warn!(path = %self.path.display(), %error, "Discarding corrupt symbol cache");
                Ok(None)
            }
        }
    }

    pub fn store(&self, symbols: &[String]) -> Result<(), DropwatchError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec(symbols)?)?;
        debug!(path = %self.path.display(), count = symbols.len(), "Stored symbol cache");
        Ok(())
    }

    /// Forget the cached list so the next resolve fetches it again.
    pub fn invalidate(&self) -> Result<(), DropwatchError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Cached symbols if present, otherwise fetch them and fill the cache.
    pub async fn resolve(&self, api: &AnalysisApi) -> Result<Vec<String>, DropwatchError> {
        match self.load() {
            Ok(Some(symbols)) => {
                debug!(count = symbols.len(), "Using cached symbols");
                return Ok(symbols);
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "Symbol cache unreadable, fetching"),
        }

        let symbols = api.fetch_usdt_pairs().await?;
        if let Err(error) = self.store(&symbols) {
            warn!(%error, "Failed to persist symbol cache");
        }
        info!(count = symbols.len(), "Resolved symbols from backend");
        Ok(symbols)
    }
}

/// The preferred symbol if the backend knows it, else the first known one.
pub fn select_symbol(symbols: &[String], preferred: &str) -> Option<String> {
    symbols
        .iter()
        .find(|symbol| symbol.eq_ignore_ascii_case(preferred))
        .or_else(|| symbols.first())
        .cloned()
}
