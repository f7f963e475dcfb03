use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, SimError};
use crate::signal::PinState;

/// Pin values keyed by pin ID. Used for root inputs going into a tick and
/// root outputs coming out of one. Serializes as `{"<id>": "<bits>"}`.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Clone, Debug, Default)]
#[serde(transparent)]
pub struct PinValues {
    values: BTreeMap<u32, PinState>,
}

impl<const N: usize> TryFrom<[(u32, bool); N]> for PinValues {
    type Error = SimError;

    fn try_from(values: [(u32, bool); N]) -> Result<Self> {
        let mut r = PinValues::new();
        for (id, v) in values {
            r.insert(id, PinState::from_bits(&[v])?);
        }
        Ok(r)
    }
}

/// Bits are given most significant first.
impl<const N: usize> TryFrom<[(u32, Vec<bool>); N]> for PinValues {
    type Error = SimError;

    fn try_from(values: [(u32, Vec<bool>); N]) -> Result<Self> {
        let mut r = PinValues::new();
        for (id, v) in values {
            r.insert(id, PinState::from_bits(&v)?);
        }
        Ok(r)
    }
}

/// Pin IDs and bit strings as text, the form the CLI and wasm callers use.
impl TryFrom<HashMap<String, String>> for PinValues {
    type Error = SimError;

    fn try_from(values: HashMap<String, String>) -> Result<Self> {
        let mut r = PinValues::new();
        for (id, bits) in values {
            let id: u32 = id.trim().parse().map_err(|_| {
                SimError::new(ErrorKind::Parse, format!("Invalid pin ID {:?}", id))
            })?;
            r.insert(id, bits.trim().parse()?);
        }
        Ok(r)
    }
}

impl std::fmt::Display for PinValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        for (id, value) in &self.values {
            writeln!(&mut s, "{}: {}", id, value)?;
        }
        write!(f, "{}", s)
    }
}

impl FromIterator<(u32, PinState)> for PinValues {
    fn from_iter<I: IntoIterator<Item = (u32, PinState)>>(iter: I) -> Self {
        PinValues {
            values: iter.into_iter().collect(),
        }
    }
}

impl PinValues {
    pub fn new() -> PinValues {
        PinValues {
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: u32) -> Option<&PinState> {
        self.values.get(&id)
    }

    pub fn insert(&mut self, id: u32, value: PinState) {
        self.values.insert(id, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &PinState)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
