//! The catalogue of built-in chips: name lookup, pin layout and initial
//! internal state.

use crate::config::SimConfig;
use crate::description::{ChipDescription, ChipType, PinDescription};
use crate::signal::BitWidth;

/// Words of ROM or RAM.
pub const MEMORY_WORDS: usize = 256;
pub const ROM_WORD_BITS: usize = 16;
pub const RAM_WORD_BITS: usize = 8;
/// Pixels in the RGB display's back and front buffers.
pub const DISPLAY_PIXELS: usize = 256;

/// Bus partner word of a bus chip that is not linked.
pub const UNLINKED: u64 = u64::MAX;
/// Pin IDs shared by both halves of a bus.
pub const BUS_IN: u32 = 0;
pub const BUS_OUT: u32 = 1;

/// Key a new key chip listens for.
pub const DEFAULT_KEY: char = 'K';

fn parse_width(s: &str) -> Option<BitWidth> {
    let bits: usize = s.parse().ok()?;
    BitWidth::try_from(bits).ok()
}

fn parse_widths(s: &str) -> Option<(BitWidth, BitWidth)> {
    let (a, b) = s.split_once('-')?;
    Some((parse_width(a)?, parse_width(b)?))
}

/// Resolves a built-in chip by name, ignoring case. Returns None for names
/// that should be looked up in a chip library instead.
pub fn lookup(name: &str) -> Option<ChipType> {
    let name = name.to_uppercase();
    let chip_type = match name.as_str() {
        "NAND" => ChipType::Nand,
        "CLOCK" => ChipType::Clock,
        "PULSE" => ChipType::Pulse,
        "KEY" => ChipType::Key,
        "ROM" | "ROM-256X16" => ChipType::Rom,
        "RAM" | "RAM-256X8" => ChipType::Ram,
        "LED" => ChipType::Led,
        "7-SEGMENT" => ChipType::SevenSegment,
        "DISPLAY-RGB" => ChipType::DisplayRgb,
        _ => {
            if let Some(w) = name.strip_prefix("TRISTATE-") {
                ChipType::TriStateBuffer {
                    width: parse_width(w)?,
                }
            } else if let Some(w) = name.strip_prefix("BUS-TERMINUS-") {
                ChipType::BusTerminus {
                    width: parse_width(w)?,
                }
            } else if let Some(w) = name.strip_prefix("BUS-") {
                ChipType::BusOrigin {
                    width: parse_width(w)?,
                }
            } else if let Some(w) = name.strip_prefix("SPLIT-") {
                let (from, into) = parse_widths(w)?;
                if from.bits() <= into.bits() {
                    return None;
                }
                ChipType::Split { from, into }
            } else if let Some(w) = name.strip_prefix("MERGE-") {
                let (from, into) = parse_widths(w)?;
                if from.bits() >= into.bits() {
                    return None;
                }
                ChipType::Merge { from, into }
            } else {
                return None;
            }
        }
    };
    Some(chip_type)
}

fn pin(id: u32, name: &str, width: BitWidth) -> PinDescription {
    PinDescription {
        id,
        name: String::from(name),
        width,
    }
}

/// Input and output pins of a built-in chip.
pub fn pins(chip_type: ChipType) -> (Vec<PinDescription>, Vec<PinDescription>) {
    use BitWidth as W;

    match chip_type {
        ChipType::Custom => (Vec::new(), Vec::new()),
        ChipType::Nand => (
            vec![pin(0, "a", W::ONE), pin(1, "b", W::ONE)],
            vec![pin(2, "out", W::ONE)],
        ),
        ChipType::TriStateBuffer { width } => (
            vec![pin(0, "in", width), pin(1, "enable", W::ONE)],
            vec![pin(2, "out", width)],
        ),
        ChipType::Split { from, into } => {
            let n = from.bits() / into.bits();
            let outputs = (0..n)
                .map(|i| pin(i as u32 + 1, &format!("out{}", i), into))
                .collect();
            (vec![pin(0, "in", from)], outputs)
        }
        ChipType::Merge { from, into } => {
            let n = into.bits() / from.bits();
            let inputs = (0..n)
                .map(|i| pin(i as u32, &format!("in{}", i), from))
                .collect();
            (inputs, vec![pin(n as u32, "out", into)])
        }
        ChipType::Clock | ChipType::Key => (Vec::new(), vec![pin(0, "out", W::ONE)]),
        ChipType::Pulse => (vec![pin(0, "in", W::ONE)], vec![pin(1, "out", W::ONE)]),
        ChipType::Rom => (
            vec![pin(0, "address", W::EIGHT)],
            vec![pin(1, "out", W::SIXTEEN)],
        ),
        ChipType::Ram => (
            vec![
                pin(0, "address", W::EIGHT),
                pin(1, "data", W::EIGHT),
                pin(2, "write", W::ONE),
                pin(3, "reset", W::ONE),
            ],
            vec![pin(4, "out", W::EIGHT)],
        ),
        ChipType::BusOrigin { width } | ChipType::BusTerminus { width } => {
            (vec![pin(BUS_IN, "in", width)], vec![pin(BUS_OUT, "out", width)])
        }
        ChipType::Led => (vec![pin(0, "in", W::ONE)], Vec::new()),
        ChipType::SevenSegment => {
            let inputs = ["a", "b", "c", "d", "e", "f", "g", "dp"]
                .iter()
                .enumerate()
                .map(|(i, n)| pin(i as u32, n, W::ONE))
                .collect();
            (inputs, Vec::new())
        }
        ChipType::DisplayRgb => (
            vec![
                pin(0, "address", W::EIGHT),
                pin(1, "red", W::FOUR),
                pin(2, "green", W::FOUR),
                pin(3, "blue", W::FOUR),
                pin(4, "write", W::ONE),
                pin(5, "refresh", W::ONE),
                pin(6, "clock", W::ONE),
            ],
            Vec::new(),
        ),
    }
}

/// A description carrying only the pins of a built-in chip.
pub fn description(chip_type: ChipType) -> ChipDescription {
    let (inputs, outputs) = pins(chip_type);
    ChipDescription {
        name: chip_type.name(),
        inputs,
        outputs,
        sub_chips: Vec::new(),
        wires: Vec::new(),
    }
}

fn memory(declared: &[u64], word_bits: usize) -> Vec<u64> {
    let mask = (1u64 << word_bits) - 1;
    let mut words: Vec<u64> = declared
        .iter()
        .take(MEMORY_WORDS)
        .map(|w| w & mask)
        .collect();
    words.resize(MEMORY_WORDS, 0);
    words
}

/// Internal-state words for a built-in instance, starting from whatever the
/// description (or a later update) supplied. Missing words take defaults,
/// memory contents are masked to the word size.
pub fn initial_state(chip_type: ChipType, declared: &[u64], config: &SimConfig) -> Vec<u64> {
    let word = |i: usize, default: u64| declared.get(i).copied().unwrap_or(default);

    match chip_type {
        ChipType::Clock => vec![word(0, 0), word(1, 0) & 1],
        ChipType::Pulse => vec![
            word(0, config.default_pulse_width),
            word(1, 0),
            word(2, 0) & 1,
        ],
        ChipType::Key => vec![word(0, DEFAULT_KEY as u64)],
        ChipType::Rom => memory(declared, ROM_WORD_BITS),
        ChipType::Ram => memory(declared, RAM_WORD_BITS),
        ChipType::BusOrigin { .. } | ChipType::BusTerminus { .. } => vec![word(0, UNLINKED)],
        ChipType::DisplayRgb => {
            let mut state = vec![word(0, 0) & 1];
            state.extend((1..=2 * DISPLAY_PIXELS).map(|i| word(i, 0) & 0xfff));
            state
        }
        _ => declared.to_vec(),
    }
}
