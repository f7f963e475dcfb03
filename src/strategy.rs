//! Evaluation strategies for built-in chips.
//!
//! Each built-in [`ChipType`] selects one strategy. A strategy reads the
//! instance's input pins and internal state, and writes its output pins and
//! internal state. Custom chips have no strategy, the simulator evaluates
//! their children instead.

use std::collections::BTreeSet;

use crate::builtin::{DISPLAY_PIXELS, MEMORY_WORDS};
use crate::description::ChipType;
use crate::instance::Pin;
use crate::signal::{BitValue, BitWidth, PinState};

/// Per-tick values shared by every evaluation in the tick.
#[derive(Clone, Copy, Debug)]
pub struct EvalContext<'a> {
    pub steps_per_clock_transition: u32,
    pub keys_down: &'a BTreeSet<u32>,
}

/// Borrowed view of one instance's pins and state.
pub struct ChipIo<'a> {
    pub inputs: &'a [Pin],
    pub outputs: &'a mut [Pin],
    pub state: &'a mut Vec<u64>,
}

impl<'a> ChipIo<'a> {
    fn input(&self, i: usize) -> Option<&PinState> {
        self.inputs.get(i).map(|p| &p.state)
    }

    fn input_high(&self, i: usize) -> bool {
        self.input(i).map_or(false, |s| s.first_bit_high())
    }

    fn input_u64(&self, i: usize) -> Option<u64> {
        self.input(i).and_then(|s| s.value_u64())
    }

    fn output(&mut self, i: usize) -> Option<&mut PinState> {
        self.outputs.get_mut(i).map(|p| &mut p.state)
    }

    fn set_output(&mut self, i: usize, value: &PinState) {
        if let Some(out) = self.output(i) {
            if let Err(e) = out.copy_from(value) {
                log::debug!("Output {} not written: {}", i, e);
            }
        }
    }

    fn set_output_bit(&mut self, i: usize, bit: BitValue) {
        if let Some(out) = self.output(i) {
            out.set_bit(0, bit);
        }
    }
}

pub trait EvaluationStrategy: Sync {
    fn evaluate(&self, chip_type: ChipType, io: ChipIo<'_>, ctx: &EvalContext<'_>);
}

impl ChipType {
    /// The strategy evaluating this chip type, None for custom chips.
    pub fn strategy(&self) -> Option<&'static dyn EvaluationStrategy> {
        match self {
            ChipType::Custom => None,
            ChipType::Nand
            | ChipType::TriStateBuffer { .. }
            | ChipType::Split { .. }
            | ChipType::Merge { .. } => Some(&Combinational),
            ChipType::Clock | ChipType::Pulse | ChipType::Key => Some(&Clocked),
            ChipType::Rom | ChipType::Ram | ChipType::DisplayRgb => Some(&Memory),
            ChipType::BusOrigin { .. }
            | ChipType::BusTerminus { .. }
            | ChipType::Led
            | ChipType::SevenSegment => Some(&PassThrough),
        }
    }
}

/// NAND over three-valued bits. A Low input decides the result on its own.
pub fn nand(a: BitValue, b: BitValue) -> BitValue {
    match (a, b) {
        (BitValue::Low, _) | (_, BitValue::Low) => BitValue::High,
        (BitValue::High, BitValue::High) => BitValue::Low,
        _ => BitValue::Floating,
    }
}

/// Outputs are a function of this tick's inputs only.
pub struct Combinational;

impl EvaluationStrategy for Combinational {
    fn evaluate(&self, chip_type: ChipType, mut io: ChipIo<'_>, _ctx: &EvalContext<'_>) {
        match chip_type {
            ChipType::Nand => {
                let bit = |io: &ChipIo, i| io.input(i).map_or(BitValue::Floating, |s| s.bit(0));
                let out = nand(bit(&io, 0), bit(&io, 1));
                io.set_output_bit(0, out);
            }
            ChipType::TriStateBuffer { width } => {
                let value = if io.input_high(1) {
                    io.input(0).copied()
                } else {
                    None
                };
                io.set_output(0, &value.unwrap_or_else(|| PinState::floating(width)));
            }
            ChipType::Split { into, .. } => {
                let source = match io.input(0) {
                    Some(s) => *s,
                    None => return,
                };
                let step = into.bits();
                for (k, out) in io.outputs.iter_mut().enumerate() {
                    out.state.copy_bits(0, &source, k * step, step);
                }
            }
            ChipType::Merge { from, into } => {
                let step = from.bits();
                let mut merged = PinState::floating(into);
                for (k, input) in io.inputs.iter().enumerate() {
                    merged.copy_bits(k * step, &input.state, 0, step);
                }
                io.set_output(0, &merged);
            }
            _ => log::error!("{} is not combinational", chip_type.name()),
        }
    }
}

/// Chips that advance on every tick: clocks, pulses and keys.
pub struct Clocked;

impl EvaluationStrategy for Clocked {
    fn evaluate(&self, chip_type: ChipType, mut io: ChipIo<'_>, ctx: &EvalContext<'_>) {
        match chip_type {
            ChipType::Clock => {
                // [counter, output]
                if io.state.len() < 2 {
                    io.state.resize(2, 0);
                }
                io.state[0] += 1;
                if io.state[0] >= u64::from(ctx.steps_per_clock_transition.max(1)) {
                    io.state[0] = 0;
                    io.state[1] ^= 1;
                }
                let out = BitValue::from(io.state[1] == 1);
                io.set_output_bit(0, out);
            }
            ChipType::Pulse => {
                // [width, remaining, previous input]
                if io.state.len() < 3 {
                    io.state.resize(3, 0);
                }
                let high = io.input_high(0);
                if high && io.state[2] == 0 {
                    io.state[1] = io.state[0];
                }
                io.state[2] = u64::from(high);
                let active = io.state[1] > 0;
                if active {
                    io.state[1] -= 1;
                }
                io.set_output_bit(0, BitValue::from(active));
            }
            ChipType::Key => {
                let held = io
                    .state
                    .first()
                    .and_then(|code| u32::try_from(*code).ok())
                    .map_or(false, |code| ctx.keys_down.contains(&code));
                io.set_output_bit(0, BitValue::from(held));
            }
            _ => log::error!("{} is not clocked", chip_type.name()),
        }
    }
}

/// Addressed storage: ROM, RAM and the RGB display buffers.
pub struct Memory;

impl EvaluationStrategy for Memory {
    fn evaluate(&self, chip_type: ChipType, mut io: ChipIo<'_>, _ctx: &EvalContext<'_>) {
        let address = io
            .input_u64(0)
            .map(|a| a as usize)
            .filter(|a| *a < MEMORY_WORDS);

        match chip_type {
            ChipType::Rom => {
                let out = match address.and_then(|a| io.state.get(a)) {
                    Some(word) => PinState::from_u64(BitWidth::SIXTEEN, *word),
                    None => PinState::floating(BitWidth::SIXTEEN),
                };
                io.set_output(0, &out);
            }
            ChipType::Ram => {
                if io.input_high(3) {
                    io.state.iter_mut().for_each(|w| *w = 0);
                } else if io.input_high(2) {
                    if let (Some(a), Some(data)) = (address, io.input_u64(1)) {
                        if let Some(word) = io.state.get_mut(a) {
                            *word = data;
                        }
                    }
                }
                let out = match address.and_then(|a| io.state.get(a)) {
                    Some(word) => PinState::from_u64(BitWidth::EIGHT, *word),
                    None => PinState::floating(BitWidth::EIGHT),
                };
                io.set_output(0, &out);
            }
            ChipType::DisplayRgb => {
                // [previous clock, back buffer, front buffer]
                if io.state.len() < 1 + 2 * DISPLAY_PIXELS {
                    io.state.resize(1 + 2 * DISPLAY_PIXELS, 0);
                }
                let clock = io.input_high(6);
                let rising = clock && io.state[0] == 0;
                io.state[0] = u64::from(clock);
                if !rising {
                    return;
                }

                if io.input_high(4) {
                    if let Some(a) = address {
                        let channel = |i| io.input_u64(i).unwrap_or(0);
                        let colour = channel(1) << 8 | channel(2) << 4 | channel(3);
                        io.state[1 + a] = colour;
                    }
                }
                if io.input_high(5) {
                    io.state
                        .copy_within(1..=DISPLAY_PIXELS, 1 + DISPLAY_PIXELS);
                }
            }
            _ => log::error!("{} is not a memory", chip_type.name()),
        }
    }
}

/// Bus halves copy input to output. Display sinks have no outputs and are
/// read from snapshots.
pub struct PassThrough;

impl EvaluationStrategy for PassThrough {
    fn evaluate(&self, chip_type: ChipType, mut io: ChipIo<'_>, _ctx: &EvalContext<'_>) {
        match chip_type {
            ChipType::BusOrigin { .. } | ChipType::BusTerminus { .. } => {
                if let Some(value) = io.input(0).copied() {
                    io.set_output(0, &value);
                }
            }
            ChipType::Led | ChipType::SevenSegment => {}
            _ => log::error!("{} is not a pass-through", chip_type.name()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builtin;
    use crate::config::SimConfig;
    use crate::instance::PinDirection;

    struct Harness {
        chip_type: ChipType,
        inputs: Vec<Pin>,
        outputs: Vec<Pin>,
        state: Vec<u64>,
        keys_down: BTreeSet<u32>,
        steps: u32,
    }

    impl Harness {
        fn new(chip_type: ChipType) -> Harness {
            let (inputs, outputs) = builtin::pins(chip_type);
            Harness {
                chip_type,
                inputs: inputs
                    .iter()
                    .map(|p| Pin::new(p, PinDirection::Input))
                    .collect(),
                outputs: outputs
                    .iter()
                    .map(|p| Pin::new(p, PinDirection::Output))
                    .collect(),
                state: builtin::initial_state(chip_type, &[], &SimConfig::default()),
                keys_down: BTreeSet::new(),
                steps: 2,
            }
        }

        fn set(&mut self, i: usize, value: &str) {
            self.inputs[i].state = value.parse().unwrap();
        }

        fn tick(&mut self) {
            let ctx = EvalContext {
                steps_per_clock_transition: self.steps,
                keys_down: &self.keys_down,
            };
            let io = ChipIo {
                inputs: &self.inputs,
                outputs: &mut self.outputs,
                state: &mut self.state,
            };
            self.chip_type
                .strategy()
                .expect("built-in chip")
                .evaluate(self.chip_type, io, &ctx);
        }

        fn out(&self, i: usize) -> String {
            self.outputs[i].state.to_string()
        }
    }

    #[test]
    fn test_nand_kleene() {
        use BitValue::*;
        assert_eq!(nand(Low, Low), High);
        assert_eq!(nand(Low, Floating), High);
        assert_eq!(nand(High, High), Low);
        assert_eq!(nand(High, Floating), Floating);
        assert_eq!(nand(Floating, Floating), Floating);
    }

    #[test]
    fn test_nand_with_unconnected_input() {
        let mut h = Harness::new(ChipType::Nand);
        h.tick();
        assert_eq!(h.out(0), "Z");
        h.set(0, "0");
        h.tick();
        assert_eq!(h.out(0), "1");
    }

    #[test]
    fn test_tristate() {
        let mut h = Harness::new(ChipType::TriStateBuffer {
            width: BitWidth::FOUR,
        });
        h.set(0, "1010");
        h.set(1, "0");
        h.tick();
        assert_eq!(h.out(0), "ZZZZ");
        h.set(1, "1");
        h.tick();
        assert_eq!(h.out(0), "1010");
    }

    #[test]
    fn test_split_and_merge_lsb_first() {
        let mut split = Harness::new(ChipType::Split {
            from: BitWidth::EIGHT,
            into: BitWidth::FOUR,
        });
        split.set(0, "1100Z011");
        split.tick();
        assert_eq!(split.out(0), "Z011");
        assert_eq!(split.out(1), "1100");

        let mut merge = Harness::new(ChipType::Merge {
            from: BitWidth::FOUR,
            into: BitWidth::EIGHT,
        });
        merge.set(0, "0011");
        merge.set(1, "1111");
        merge.tick();
        assert_eq!(merge.out(0), "11110011");
    }

    #[test]
    fn test_clock_toggles_every_k_ticks() {
        let mut h = Harness::new(ChipType::Clock);
        h.steps = 3;
        let mut seen = Vec::new();
        for _ in 0..7 {
            h.tick();
            seen.push(h.out(0));
        }
        assert_eq!(seen, ["0", "0", "1", "1", "1", "0", "0"]);
    }

    #[test]
    fn test_pulse_on_rising_edge() {
        let mut h = Harness::new(ChipType::Pulse);
        h.state[0] = 2;
        h.set(0, "1");
        h.tick();
        assert_eq!(h.out(0), "1");
        h.tick();
        assert_eq!(h.out(0), "1");
        h.tick();
        assert_eq!(h.out(0), "0");
        h.set(0, "0");
        h.tick();
        assert_eq!(h.out(0), "0");
        h.set(0, "1");
        h.tick();
        assert_eq!(h.out(0), "1");
    }

    #[test]
    fn test_key() {
        let mut h = Harness::new(ChipType::Key);
        h.tick();
        assert_eq!(h.out(0), "0");
        h.keys_down.insert(builtin::DEFAULT_KEY as u32);
        h.tick();
        assert_eq!(h.out(0), "1");
    }

    #[test]
    fn test_ram_write_read_reset() {
        let mut h = Harness::new(ChipType::Ram);
        h.set(0, "00000011");
        h.set(1, "10101010");
        h.set(2, "1");
        h.set(3, "0");
        h.tick();
        assert_eq!(h.out(0), "10101010");
        assert_eq!(h.state[3], 0xaa);

        h.set(1, "11111111");
        h.set(2, "0");
        h.tick();
        assert_eq!(h.out(0), "10101010");

        h.set(3, "1");
        h.tick();
        assert_eq!(h.out(0), "00000000");
    }

    #[test]
    fn test_rom_floating_address() {
        let mut h = Harness::new(ChipType::Rom);
        h.state[1] = 0xbeef;
        h.tick();
        assert!(h.outputs[0].state.is_floating());
        h.set(0, "00000001");
        h.tick();
        assert_eq!(h.outputs[0].state.value_u64(), Some(0xbeef));
    }

    #[test]
    fn test_display_buffers() {
        let mut h = Harness::new(ChipType::DisplayRgb);
        h.set(0, "00000010");
        h.set(1, "1111");
        h.set(2, "0000");
        h.set(3, "0001");
        h.set(4, "1");
        h.set(5, "0");
        h.set(6, "1");
        h.tick();
        assert_eq!(h.state[1 + 2], 0xf01);
        assert_eq!(h.state[1 + DISPLAY_PIXELS + 2], 0);

        // No edge, no refresh.
        h.set(5, "1");
        h.tick();
        assert_eq!(h.state[1 + DISPLAY_PIXELS + 2], 0);

        h.set(6, "0");
        h.tick();
        h.set(6, "1");
        h.tick();
        assert_eq!(h.state[1 + DISPLAY_PIXELS + 2], 0xf01);
    }

    #[test]
    fn test_bus_copies() {
        let mut h = Harness::new(ChipType::BusOrigin {
            width: BitWidth::FOUR,
        });
        h.set(0, "1Z01");
        h.tick();
        assert_eq!(h.out(0), "1Z01");
    }
}
