//! ChartStore - arena of shared chart definitions
//!
//! Charts are parsed once per source and handed out as `ChartHandle`s.
//! Each slot counts the handles resolved against it and is freed when the
//! last one is released.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::error::ParseError;
use crate::loader;
use crate::model::ChartDefinition;

/// Non-owning reference to a chart slot in a `ChartStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChartHandle(usize);

impl ChartHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct CachedChart {
    modified: Option<SystemTime>,
    chart: Arc<ChartDefinition>,
}

#[derive(Debug)]
struct Slot {
    key: String,
    chart: Arc<ChartDefinition>,
    refs: usize,
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Option<Slot>>,
    by_key: HashMap<String, usize>,
    free: Vec<usize>,
}

impl Arena {
    fn acquire(&mut self, key: &str, chart: Arc<ChartDefinition>) -> ChartHandle {
        if let Some(&index) = self.by_key.get(key) {
            if let Some(slot) = self.slots[index].as_mut() {
                if Arc::ptr_eq(&slot.chart, &chart) {
                    slot.refs += 1;
                    return ChartHandle(index);
                }
            }
        }

        // New source, or the source changed since the slot was filled.
        // Handles to the previous version stay valid until released.
        let slot = Slot {
            key: key.to_string(),
            chart,
            refs: 1,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_key.insert(key.to_string(), index);
        ChartHandle(index)
    }

    fn release(&mut self, handle: ChartHandle) -> bool {
        let Some(entry) = self.slots.get_mut(handle.0) else {
            return false;
        };
        let Some(slot) = entry.as_mut() else {
            return false;
        };

        slot.refs -= 1;
        if slot.refs > 0 {
            return true;
        }

        let key = slot.key.clone();
        *entry = None;
        self.free.push(handle.0);
        if self.by_key.get(&key) == Some(&handle.0) {
            self.by_key.remove(&key);
        }
        true
    }
}

/// Arena of parsed charts, keyed by source identity.
#[derive(Debug, Default)]
pub struct ChartStore {
    chart_dir: Option<PathBuf>,
    files: RwLock<HashMap<PathBuf, CachedChart>>,
    sources: RwLock<HashMap<String, Arc<ChartDefinition>>>,
    arena: RwLock<Arena>,
}

impl ChartStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that resolves relative chart references against `dir`.
    pub fn with_chart_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            chart_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn chart_dir(&self) -> Option<&Path> {
        self.chart_dir.as_deref()
    }

    /// Register in-memory chart source under `key`.
    ///
    /// A later `resolve(key)` prefers this source over the filesystem.
    pub fn insert_source(
        &self,
        key: impl Into<String>,
        text: &str,
    ) -> Result<Arc<ChartDefinition>, ParseError> {
        let key = key.into();
        let mut chart = loader::load(text)?;
        if chart.id.trim().is_empty() {
            chart.id = key.clone();
        }

        let chart = Arc::new(chart);
        self.sources
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, chart.clone());
        Ok(chart)
    }

    /// Load a chart file, re-parsing only when its modification time changed.
    pub fn load_file(&self, path: &Path) -> Result<Arc<ChartDefinition>, ParseError> {
        let metadata = fs::metadata(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let modified = metadata.modified().ok();

        let cache = self
            .files
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = cache.get(path) {
            if modified.is_some() && cached.modified == modified {
                return Ok(cached.chart.clone());
            }
        }
        drop(cache);

        let chart = Arc::new(loader::load_file(path)?);
        tracing::debug!(path = %path.display(), chart = %chart.id, "chart loaded");

        self.files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                path.to_path_buf(),
                CachedChart {
                    modified,
                    chart: chart.clone(),
                },
            );
        Ok(chart)
    }

    /// Resolve a chart reference to a handle, taking a reference on the slot.
    ///
    /// Registered in-memory sources win; otherwise the reference is a path,
    /// relative to the chart directory when one is configured.
    pub fn resolve(&self, reference: &str) -> Result<ChartHandle, ParseError> {
        let source = self
            .sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(reference)
            .cloned();

        let (key, chart) = match source {
            Some(chart) => (reference.to_string(), chart),
            None => {
                let path = self.reference_path(reference);
                if !path.is_file() {
                    return Err(ParseError::UnknownChart(reference.to_string()));
                }
                let chart = self.load_file(&path)?;
                (path.to_string_lossy().into_owned(), chart)
            }
        };

        let handle = self
            .arena
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .acquire(&key, chart);
        Ok(handle)
    }

    pub fn get(&self, handle: ChartHandle) -> Option<Arc<ChartDefinition>> {
        self.arena
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .map(|slot| slot.chart.clone())
    }

    /// Drop one reference; the slot is freed when none remain.
    ///
    /// Returns false for a handle that does not name a live slot.
    pub fn release(&self, handle: ChartHandle) -> bool {
        self.arena
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .release(handle)
    }

    pub fn ref_count(&self, handle: ChartHandle) -> usize {
        self.arena
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .map_or(0, |slot| slot.refs)
    }

    /// Number of live chart slots.
    pub fn len(&self) -> usize {
        self.arena
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .slots
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reference_path(&self, reference: &str) -> PathBuf {
        match &self.chart_dir {
            Some(dir) => dir.join(reference),
            None => PathBuf::from(reference),
        }
    }
}
