pub mod builtin;
pub mod busmap;
pub mod config;
pub mod description;
pub mod driver;
pub mod error;
pub mod instance;
pub mod library;
pub mod modification;
pub mod netlist;
pub mod signal;
pub mod simulator;
pub mod snapshot;
pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use rust_embed::RustEmbed;
use serde::Serialize;
use wasm_bindgen::prelude::*;

use crate::busmap::PinValues;
use crate::config::{SimConfig, SimContext};
use crate::description::ChipDescription;
use crate::error::{ErrorKind, Result, SimError};
use crate::library::{ChipLibrary, LayeredLibrary, MemoryLibrary};
use crate::signal::PinState;
use crate::simulator::Simulator;

/// Largest number of input bits a truth table is generated for.
pub const MAX_TABLE_INPUT_BITS: usize = 10;

#[derive(RustEmbed)]
#[folder = "resources/library"]
struct LibraryAsset;

/// The standard chips shipped inside the binary (Not, And, Or, Xor, the
/// latches).
pub struct EmbedLibrary;

impl ChipLibrary for EmbedLibrary {
    fn get_description(&self, name: &str) -> Result<ChipDescription> {
        let asset = LibraryAsset::get(&format!("{}.json", name))
            .ok_or_else(|| library::unresolved(name, "Not in the standard library."))?;
        let json = std::str::from_utf8(asset.data.as_ref()).map_err(|e| {
            SimError::new(ErrorKind::Parse, format!("{}.json is not UTF-8: {}", name, e))
        })?;
        ChipDescription::from_json(json)
    }
}

/// A library made of caller supplied descriptions (a JSON array, possibly
/// empty) backed by the standard chips.
pub fn library_from_json(library_json: &str) -> Result<LayeredLibrary> {
    let user = if library_json.trim().is_empty() {
        MemoryLibrary::new()
    } else {
        MemoryLibrary::from_json(library_json)?
    };
    Ok(LayeredLibrary::new()
        .with(Arc::new(user))
        .with(Arc::new(EmbedLibrary)))
}

fn set_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Builds `chip`, runs a single tick with `inputs_json` (pin ID to bit
/// string) and returns the outputs as JSON.
#[wasm_bindgen]
pub fn simulate(library_json: &str, chip: &str, inputs_json: &str) -> std::result::Result<String, JsValue> {
    set_panic_hook();
    simulate_internal(library_json, chip, inputs_json).map_err(|e| JsValue::from(e.to_string()))
}

fn simulate_internal(library_json: &str, chip: &str, inputs_json: &str) -> Result<String> {
    let library = library_from_json(library_json)?;
    let ctx = Arc::new(SimContext::new(SimConfig::default(), Arc::new(library)));
    let mut simulator = Simulator::build(chip, ctx)?;
    let inputs: HashMap<String, String> = serde_json::from_str(inputs_json)?;
    let outputs = simulator.simulate(&PinValues::try_from(inputs)?)?;
    Ok(serde_json::to_string(&outputs)?)
}

#[wasm_bindgen]
pub fn truth_table(library_json: &str, chip: &str) -> std::result::Result<String, JsValue> {
    set_panic_hook();
    let table = library_from_json(library_json)
        .and_then(|library| truth_table_internal(chip, Arc::new(library)))
        .map_err(|e| JsValue::from(e.to_string()))?;
    serde_json::to_string(&table).map_err(|e| JsValue::from(e.to_string()))
}

/// Column names are the root's input pins followed by its outputs. Each row
/// holds the bit strings of those pins.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TruthTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Steps a fresh simulator once per input combination. The first input pin
/// takes the most significant bits of the row number.
pub fn truth_table_internal(chip: &str, library: Arc<dyn ChipLibrary>) -> Result<TruthTable> {
    let ctx = Arc::new(SimContext::new(SimConfig::default(), library));
    let mut simulator = Simulator::build(chip, ctx)?;

    let inputs: Vec<(u32, usize)> = simulator
        .chip
        .inputs
        .iter()
        .map(|p| (p.id, p.width().bits()))
        .collect();
    let total_width: usize = inputs.iter().map(|(_, w)| w).sum();
    if total_width > MAX_TABLE_INPUT_BITS {
        return Err(SimError::new(
            ErrorKind::Other,
            format!(
                "Too many rows in truth table to display ({} input bits, max {}).",
                total_width, MAX_TABLE_INPUT_BITS
            ),
        ));
    }

    let columns = simulator
        .chip
        .inputs
        .iter()
        .chain(simulator.chip.outputs.iter())
        .map(|p| p.name.clone())
        .collect();

    let mut rows = Vec::new();
    for row in 0..(1u64 << total_width) {
        let mut values = PinValues::new();
        let mut shift = total_width;
        for (id, width) in &inputs {
            shift -= width;
            let mask = (1u64 << width) - 1;
            values.insert(*id, PinState::from_u64((*width).try_into()?, (row >> shift) & mask));
        }
        let outputs = simulator.simulate(&values)?;

        // Declared order, not ID order.
        let mut cells = Vec::new();
        for (id, _) in &inputs {
            cells.extend(values.get(*id).map(|v| v.to_string()));
        }
        for pin in &simulator.chip.outputs {
            cells.extend(outputs.get(pin.id).map(|v| v.to_string()));
        }
        rows.push(cells);
    }

    Ok(TruthTable { columns, rows })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_embedded_library() {
        for name in ["Not", "And", "Or", "Xor", "SrLatch", "DLatch"] {
            let desc = EmbedLibrary.get_description(name).unwrap();
            assert_eq!(desc.name, name);
        }
        assert!(EmbedLibrary.get_description("Mux").is_err());
    }

    #[test]
    fn test_truth_table() {
        let table = truth_table_internal("Xor", Arc::new(EmbedLibrary)).unwrap();
        assert_eq!(table.columns, vec!["a", "b", "out"]);
        assert_eq!(
            table.rows,
            vec![
                vec!["0", "0", "0"],
                vec!["0", "1", "1"],
                vec!["1", "0", "1"],
                vec!["1", "1", "0"],
            ]
        );
    }

    #[test]
    fn test_truth_table_too_wide() {
        let library = library_from_json(
            r#"[{"name": "Wide", "inputs": [{"id": 0, "name": "in", "width": 16}]}]"#,
        )
        .unwrap();
        let err = truth_table_internal("Wide", Arc::new(library)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Other);
    }

    #[test]
    fn test_simulate_json() {
        let outputs = simulate_internal("", "And", r#"{"0": "1", "1": "1"}"#).unwrap();
        assert_eq!(outputs, r#"{"2":"1"}"#);

        let custom = r#"[{"name": "Buffer",
            "inputs": [{"id": 0, "name": "in", "width": 1}],
            "outputs": [{"id": 1, "name": "out", "width": 1}],
            "sub_chips": [{"id": 5, "name": "Not"}, {"id": 6, "name": "Not"}],
            "wires": [
                {"source": {"owner": 0, "pin": 0}, "target": {"owner": 5, "pin": 0}},
                {"source": {"owner": 5, "pin": 1}, "target": {"owner": 6, "pin": 0}},
                {"source": {"owner": 6, "pin": 1}, "target": {"owner": 1, "pin": 1}}
            ]}]"#;
        let outputs = simulate_internal(custom, "Buffer", r#"{"0": "0"}"#).unwrap();
        assert_eq!(outputs, r#"{"1":"0"}"#);
    }
}
