//! Chip libraries resolve sub-chip names to descriptions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::builtin;
use crate::description::{ChipDescription, ChipType};
use crate::error::{ErrorKind, Result, SimError};

pub trait ChipLibrary: Send + Sync {
    /// Description of the custom chip called `name`.
    fn get_description(&self, name: &str) -> Result<ChipDescription>;
}

pub(crate) fn unresolved(name: &str, detail: impl std::fmt::Display) -> SimError {
    SimError::new(
        ErrorKind::UnresolvedChip(String::from(name)),
        format!("Unable to resolve chip {}. {}", name, detail),
    )
}

/// Descriptions held in memory, keyed by chip name.
#[derive(Clone, Debug, Default)]
pub struct MemoryLibrary {
    chips: HashMap<String, ChipDescription>,
}

impl MemoryLibrary {
    pub fn new() -> MemoryLibrary {
        MemoryLibrary::default()
    }

    pub fn insert(&mut self, desc: ChipDescription) {
        self.chips.insert(desc.name.clone(), desc);
    }

    /// Reads a JSON array of descriptions.
    pub fn from_json(json: &str) -> Result<MemoryLibrary> {
        let descs: Vec<ChipDescription> = serde_json::from_str(json)?;
        let mut library = MemoryLibrary::new();
        for desc in descs {
            library.insert(desc);
        }
        Ok(library)
    }
}

impl ChipLibrary for MemoryLibrary {
    fn get_description(&self, name: &str) -> Result<ChipDescription> {
        self.chips
            .get(name)
            .cloned()
            .ok_or_else(|| unresolved(name, "No such chip in library."))
    }
}

/// A directory holding one `<Name>.json` file per chip.
#[derive(Clone, Debug)]
pub struct FileLibrary {
    base_path: PathBuf,
}

impl FileLibrary {
    pub fn new(base_path: &Path) -> FileLibrary {
        FileLibrary {
            base_path: base_path.to_path_buf(),
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", name))
    }
}

impl ChipLibrary for FileLibrary {
    fn get_description(&self, name: &str) -> Result<ChipDescription> {
        let path = self.path_of(name);
        let contents = fs::read_to_string(&path)
            .map_err(|e| unresolved(name, format!("{:?}: {}", path, e)))?;
        ChipDescription::from_json(&contents)
    }
}

/// Asks each library in turn and returns the first description found.
#[derive(Clone, Default)]
pub struct LayeredLibrary {
    layers: Vec<Arc<dyn ChipLibrary>>,
}

impl LayeredLibrary {
    pub fn new() -> LayeredLibrary {
        LayeredLibrary::default()
    }

    pub fn with(mut self, library: Arc<dyn ChipLibrary>) -> LayeredLibrary {
        self.layers.push(library);
        self
    }
}

impl ChipLibrary for LayeredLibrary {
    fn get_description(&self, name: &str) -> Result<ChipDescription> {
        let mut last_error = None;
        for layer in &self.layers {
            match layer.get_description(name) {
                Ok(desc) => return Ok(desc),
                Err(e) if matches!(e.kind, ErrorKind::UnresolvedChip(_)) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| unresolved(name, "No libraries to search.")))
    }
}

/// What a sub-chip name refers to.
#[derive(Clone, Debug)]
pub enum Resolved {
    Builtin(ChipType),
    Custom(ChipDescription),
}

/// Resolves a name against the built-in catalogue first, then the library.
pub fn resolve(name: &str, library: &dyn ChipLibrary) -> Result<Resolved> {
    if let Some(t) = builtin::lookup(name) {
        return Ok(Resolved::Builtin(t));
    }
    library.get_description(name).map(Resolved::Custom)
}
