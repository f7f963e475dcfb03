//! Static chip descriptions, the input to the netlist builder.
//!
//! Descriptions come from an editor or from a library on disk as JSON. They
//! name their sub-chips, and the library resolves those names either to a
//! built-in chip or to another description.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, SimError};
use crate::instance::PinAddress;
use crate::signal::BitWidth;

/// Tag selecting how an instance is evaluated.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(tag = "kind")]
pub enum ChipType {
    /// A composite of other chips.
    Custom,
    Nand,
    TriStateBuffer { width: BitWidth },
    /// One wide input sliced into several narrower outputs, lowest bits first.
    Split { from: BitWidth, into: BitWidth },
    /// Several narrow inputs joined into one wide output, lowest bits first.
    Merge { from: BitWidth, into: BitWidth },
    Clock,
    Pulse,
    Key,
    Rom,
    Ram,
    BusOrigin { width: BitWidth },
    BusTerminus { width: BitWidth },
    Led,
    SevenSegment,
    DisplayRgb,
}

impl ChipType {
    /// Canonical library name of a built-in chip.
    pub fn name(&self) -> String {
        match self {
            ChipType::Custom => String::from("CUSTOM"),
            ChipType::Nand => String::from("NAND"),
            ChipType::TriStateBuffer { width } => format!("TRISTATE-{}", width),
            ChipType::Split { from, into } => format!("SPLIT-{}-{}", from, into),
            ChipType::Merge { from, into } => format!("MERGE-{}-{}", from, into),
            ChipType::Clock => String::from("CLOCK"),
            ChipType::Pulse => String::from("PULSE"),
            ChipType::Key => String::from("KEY"),
            ChipType::Rom => String::from("ROM-256x16"),
            ChipType::Ram => String::from("RAM-256x8"),
            ChipType::BusOrigin { width } => format!("BUS-{}", width),
            ChipType::BusTerminus { width } => format!("BUS-TERMINUS-{}", width),
            ChipType::Led => String::from("LED"),
            ChipType::SevenSegment => String::from("7-SEGMENT"),
            ChipType::DisplayRgb => String::from("DISPLAY-RGB"),
        }
    }

    /// Built-in chips whose outputs come from latched state. Custom chips are
    /// latching when any of their children is, which the builder decides.
    pub fn is_latching(&self) -> bool {
        matches!(
            self,
            ChipType::Clock
                | ChipType::Pulse
                | ChipType::Key
                | ChipType::Rom
                | ChipType::Ram
                | ChipType::BusOrigin { .. }
                | ChipType::DisplayRgb
        )
    }

    pub fn is_bus(&self) -> bool {
        matches!(
            self,
            ChipType::BusOrigin { .. } | ChipType::BusTerminus { .. }
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PinDescription {
    pub id: u32,
    pub name: String,
    pub width: BitWidth,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SubChipDescription {
    pub id: u32,
    /// Library name of the chip, built-in or custom.
    pub name: String,
    /// Initial internal-state words: ROM contents, bus partner ID, key code,
    /// pulse width.
    #[serde(default)]
    pub internal_state: Vec<u64>,
}

impl SubChipDescription {
    pub fn new(id: u32, name: &str) -> SubChipDescription {
        SubChipDescription {
            id,
            name: String::from(name),
            internal_state: Vec::new(),
        }
    }

    pub fn with_state(id: u32, name: &str, internal_state: Vec<u64>) -> SubChipDescription {
        SubChipDescription {
            id,
            name: String::from(name),
            internal_state,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WireDescription {
    pub source: PinAddress,
    pub target: PinAddress,
    /// Index of an earlier wire in the same description that this one
    /// branches from. The branch shares that wire's source.
    #[serde(default)]
    pub branch_of: Option<usize>,
}

impl WireDescription {
    pub fn new(source: PinAddress, target: PinAddress) -> WireDescription {
        WireDescription {
            source,
            target,
            branch_of: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChipDescription {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<PinDescription>,
    #[serde(default)]
    pub outputs: Vec<PinDescription>,
    #[serde(default)]
    pub sub_chips: Vec<SubChipDescription>,
    #[serde(default)]
    pub wires: Vec<WireDescription>,
}

impl ChipDescription {
    pub fn from_json(json: &str) -> Result<ChipDescription> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn get_pin(&self, name: &str) -> Result<&PinDescription> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|p| p.name == name)
            .ok_or_else(|| {
                SimError::new(
                    ErrorKind::Other,
                    format!("Attempt to get non-existent pin {} of {}", name, self.name),
                )
            })
    }

    /// Same pins, no parts. Used in place of a chip that fails to build.
    pub fn blank(&self) -> ChipDescription {
        ChipDescription {
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            sub_chips: Vec::new(),
            wires: Vec::new(),
        }
    }
}

impl fmt::Display for ChipDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CHIP {} {{", self.name)?;

        let pins = |pins: &[PinDescription]| -> String {
            pins.iter()
                .map(|p| format!("{}#{}[{}]", p.name, p.id, p.width))
                .collect::<Vec<_>>()
                .join(", ")
        };
        writeln!(f, "    IN {};", pins(&self.inputs))?;
        writeln!(f, "    OUT {};", pins(&self.outputs))?;

        for sub in &self.sub_chips {
            writeln!(f, "\t{} #{}", sub.name, sub.id)?;
        }
        for wire in &self.wires {
            writeln!(f, "\t{} -> {}", wire.source, wire.target)?;
        }

        writeln!(f, "}}")
    }
}
