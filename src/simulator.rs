use std::collections::BTreeSet;
use std::sync::Arc;

use crate::builtin;
use crate::busmap::PinValues;
use crate::config::SimContext;
use crate::description::{ChipDescription, ChipType};
use crate::error::{ErrorKind, Result, SimError};
use crate::instance::{ChipInstance, Endpoint, Pin, Route};
use crate::modification::Modification;
use crate::netlist::{self, NetlistBuilder};
use crate::signal::PinState;
use crate::strategy::{ChipIo, EvalContext};

/// What the host supplies for one tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickInputs {
    /// Values for root input pins, by pin ID.
    pub pins: PinValues,
    /// Key codes held down during the tick.
    pub keys_down: BTreeSet<u32>,
}

impl TickInputs {
    pub fn new(pins: PinValues) -> TickInputs {
        TickInputs {
            pins,
            keys_down: BTreeSet::new(),
        }
    }
}

pub struct Simulator {
    pub chip: ChipInstance,
    ctx: Arc<SimContext>,
    tick_count: u64,
}

impl Simulator {
    pub fn new(chip: ChipInstance, ctx: Arc<SimContext>) -> Simulator {
        Simulator {
            chip,
            ctx,
            tick_count: 0,
        }
    }

    /// Builds the chip called `name` from the context's library.
    pub fn build(name: &str, ctx: Arc<SimContext>) -> Result<Simulator> {
        let chip = NetlistBuilder::new(&ctx).build_named(name)?;
        Ok(Simulator::new(chip, ctx))
    }

    pub fn from_description(desc: &ChipDescription, ctx: Arc<SimContext>) -> Result<Simulator> {
        let chip = NetlistBuilder::new(&ctx).build(desc)?;
        Ok(Simulator::new(chip, ctx))
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    /// Runs one tick: writes the root inputs, then evaluates every instance
    /// once in execution order.
    pub fn step(&mut self, inputs: &TickInputs) -> Result<()> {
        self.write_inputs(&inputs.pins)?;

        let ctx = EvalContext {
            steps_per_clock_transition: self.ctx.config.steps_per_clock_transition,
            keys_down: &inputs.keys_down,
        };
        evaluate(&mut self.chip, &ctx);
        self.tick_count += 1;
        log::trace!("Tick {} of {}", self.tick_count, self.chip.name);
        Ok(())
    }

    /// Runs one tick with no keys held and returns the root outputs.
    pub fn simulate(&mut self, inputs: &PinValues) -> Result<PinValues> {
        self.step(&TickInputs::new(inputs.clone()))?;
        Ok(self.outputs())
    }

    fn write_inputs(&mut self, values: &PinValues) -> Result<()> {
        for (id, value) in values.iter() {
            match self.chip.inputs.iter_mut().find(|p| p.id == *id) {
                Some(pin) => {
                    pin.state.copy_from(value).map_err(|e| {
                        SimError::new(e.kind, format!("Input pin {} of {}: {}", id, self.chip.name, e.msg))
                    })?;
                    pin.driven_by = None;
                }
                None => log::debug!("Ignoring value for unknown input pin {}", id),
            }
        }
        Ok(())
    }

    pub fn outputs(&self) -> PinValues {
        self.chip.outputs.iter().map(|p| (p.id, p.state)).collect()
    }

    /// Number of ticks run so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn instance(&self, path: &[u32]) -> Option<&ChipInstance> {
        self.chip.find(path)
    }

    /// Replaces the internal state of the built-in instance at `path`.
    /// Missing words take their defaults and memory words are masked to the
    /// memory's word size.
    pub fn update_internal_state(&mut self, path: &[u32], words: Vec<u64>) -> Result<()> {
        let inst = self
            .chip
            .find_mut(path)
            .ok_or_else(|| SimError::unresolved_path(path))?;
        if inst.chip_type == ChipType::Custom {
            return Err(SimError::new(
                ErrorKind::Other,
                format!("{} is a custom chip and has no internal state", inst.name),
            ));
        }
        inst.internal_state = builtin::initial_state(inst.chip_type, &words, &self.ctx.config);

        if inst.chip_type.is_bus() {
            if let Some((_, parent_path)) = path.split_last() {
                if let Some(parent) = self.chip.find_mut(parent_path) {
                    netlist::relink_buses(parent);
                }
            }
        }
        Ok(())
    }

    /// Applies one structural edit. Only the composite being edited is
    /// reordered, plus its ancestors when it gains or loses latching parts.
    pub fn apply(&mut self, modification: Modification) -> Result<()> {
        log::debug!("Applying {:?}", modification);
        match modification {
            Modification::AddPin {
                path,
                direction,
                pin,
            } => {
                netlist::add_pin(self.composite(&path)?, direction, &pin)?;
                if let Some((child, parent_path)) = path.split_last() {
                    if let Some(parent) = self.chip.find_mut(parent_path) {
                        log::trace!("Reordering parent of #{}", child);
                        netlist::recompute(parent);
                    }
                }
            }
            Modification::RemovePin { path, pin } => {
                netlist::remove_pin(self.composite(&path)?, pin)?;
                if let Some((child, parent_path)) = path.split_last() {
                    if let Some(parent) = self.chip.find_mut(parent_path) {
                        netlist::remove_child_pin_wires(parent, *child, pin);
                        netlist::recompute(parent);
                    }
                }
            }
            Modification::AddChild { path, child } => {
                let was_latching = self.composite(&path)?.is_latching();
                let ancestors = self.ancestor_names(&path);
                let ctx = self.ctx.clone();
                let parent = self.composite(&path)?;
                NetlistBuilder::with_ancestors(&ctx, ancestors).add_child(parent, &child)?;
                self.refresh_ancestors(&path, was_latching);
            }
            Modification::RemoveChild { path, child } => {
                let parent = self.composite(&path)?;
                let was_latching = parent.is_latching();
                netlist::remove_child(parent, child)?;
                self.refresh_ancestors(&path, was_latching);
            }
            Modification::AddWire { path, wire } => {
                netlist::add_wire(self.composite(&path)?, wire)?;
            }
            Modification::RemoveWire {
                path,
                source,
                target,
            } => {
                netlist::remove_wire(self.composite(&path)?, source, target)?;
            }
            Modification::RebindKey { path, key } => {
                match self.instance(&path).map(|i| i.chip_type) {
                    Some(ChipType::Key) => {}
                    Some(_) => {
                        return Err(SimError::new(
                            ErrorKind::Other,
                            format!("Instance at {:?} is not a key", path),
                        ))
                    }
                    None => return Err(SimError::unresolved_path(&path)),
                }
                self.update_internal_state(&path, vec![u64::from(key)])?;
            }
            Modification::SetInternalState { path, state } => {
                self.update_internal_state(&path, state)?;
            }
        }
        Ok(())
    }

    fn composite(&mut self, path: &[u32]) -> Result<&mut ChipInstance> {
        self.chip
            .find_mut(path)
            .ok_or_else(|| SimError::unresolved_path(path))
    }

    /// Names of the composites enclosing the instance at `path`, root first.
    fn ancestor_names(&self, path: &[u32]) -> Vec<String> {
        (0..path.len())
            .filter_map(|k| self.chip.find(&path[..k]))
            .map(|inst| inst.name.clone())
            .collect()
    }

    /// Recomputes the enclosing composites, innermost first, when the
    /// latching flag of the composite at `path` changed.
    fn refresh_ancestors(&mut self, path: &[u32], was_latching: bool) {
        let now_latching = self.chip.find(path).map_or(was_latching, |i| i.is_latching());
        if now_latching == was_latching {
            return;
        }
        for k in (0..path.len()).rev() {
            if let Some(ancestor) = self.chip.find_mut(&path[..k]) {
                netlist::recompute(ancestor);
            }
        }
    }
}

fn evaluate(inst: &mut ChipInstance, ctx: &EvalContext<'_>) {
    match inst.chip_type.strategy() {
        Some(strategy) => {
            let io = ChipIo {
                inputs: &inst.inputs,
                outputs: &mut inst.outputs,
                state: &mut inst.internal_state,
            };
            strategy.evaluate(inst.chip_type, io, ctx);
        }
        None => evaluate_custom(inst, ctx),
    }
}

fn evaluate_custom(inst: &mut ChipInstance, ctx: &EvalContext<'_>) {
    let ChipInstance {
        inputs,
        outputs,
        children,
        routes,
        ..
    } = inst;

    for route in &routes.from_boundary {
        if let Some(pin) = inputs.get(route.pin) {
            let value = pin.state;
            deliver(children, outputs, route, &value);
        }
    }

    for i in 0..children.len() {
        evaluate(&mut children[i], ctx);
        let child_routes = match routes.from_children.get(i) {
            Some(r) => r,
            None => continue,
        };
        for route in child_routes {
            if let Some(pin) = children[i].outputs.get(route.pin) {
                let value = pin.state;
                deliver(children, outputs, route, &value);
            }
        }
    }
}

/// Writes `value` into the route's target and records who drove it.
fn deliver(children: &mut [ChipInstance], outputs: &mut [Pin], route: &Route, value: &PinState) {
    let target = match route.target {
        Endpoint::ChildInput { child, pin } => children
            .get_mut(child)
            .and_then(|c| c.inputs.get_mut(pin)),
        Endpoint::BoundaryOutput { pin } => outputs.get_mut(pin),
    };
    if let Some(target) = target {
        match target.state.copy_from(value) {
            Ok(()) => target.driven_by = Some(route.source),
            Err(e) => log::debug!("Wire from {} not delivered: {}", route.source, e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SimConfig;
    use crate::description::{PinDescription, SubChipDescription};
    use crate::instance::{PinAddress, PinDirection, Wire};
    use crate::netlist::test::{assert_valid_order, context, pin, wire};
    use crate::signal::BitWidth;
    use crate::EmbedLibrary;

    fn make_simulator(name: &str) -> Simulator {
        let ctx = SimContext::new(SimConfig::default(), Arc::new(EmbedLibrary));
        Simulator::build(name, Arc::new(ctx)).expect("Chip creation error")
    }

    fn run(simulator: &mut Simulator, values: &[(u32, bool)]) -> PinValues {
        let inputs: PinValues = values
            .iter()
            .map(|(id, v)| (*id, PinState::from_u64(BitWidth::ONE, u64::from(*v))))
            .collect();
        simulator.simulate(&inputs).expect("simulation failure")
    }

    fn bit(outputs: &PinValues, id: u32) -> String {
        outputs.get(id).expect("missing output").to_string()
    }

    #[test]
    fn test_not() {
        let mut simulator = make_simulator("Not");
        assert_eq!(bit(&run(&mut simulator, &[(0, false)]), 1), "1");
        assert_eq!(bit(&run(&mut simulator, &[(0, true)]), 1), "0");
    }

    #[test]
    fn test_gate_truth_tables() {
        let tables = [
            ("And", [false, false, false, true]),
            ("Or", [false, true, true, true]),
            ("Xor", [false, true, true, false]),
        ];
        for (name, expected) in tables {
            let mut simulator = make_simulator(name);
            for (row, out) in expected.iter().enumerate() {
                let a = row & 2 != 0;
                let b = row & 1 != 0;
                let outputs = run(&mut simulator, &[(0, a), (1, b)]);
                let want = if *out { "1" } else { "0" };
                assert_eq!(bit(&outputs, 2), want, "{}({}, {})", name, a, b);
            }
        }
    }

    #[test]
    fn test_unconnected_input_floats() {
        let mut simulator = make_simulator("And");
        let outputs = run(&mut simulator, &[(0, true)]);
        assert_eq!(bit(&outputs, 2), "Z");
        let outputs = run(&mut simulator, &[(0, false)]);
        assert_eq!(bit(&outputs, 2), "0");
    }

    #[test]
    fn test_dlatch() {
        let mut simulator = make_simulator("DLatch");
        let q = |s: &mut Simulator, d, e| {
            run(s, &[(0, d), (1, e)]);
            bit(&run(s, &[(0, d), (1, e)]), 2)
        };
        assert_eq!(q(&mut simulator, true, true), "1");
        assert_eq!(q(&mut simulator, false, false), "1");
        assert_eq!(q(&mut simulator, false, true), "0");
        assert_eq!(q(&mut simulator, true, false), "0");
    }

    #[test]
    fn test_input_width_mismatch() {
        let mut simulator = make_simulator("Not");
        let inputs = PinValues::try_from([(0, vec![true, false, true, false])]).unwrap();
        let err = simulator.simulate(&inputs).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::WidthMismatch {
                expected: 1,
                found: 4
            }
        );
    }

    fn blinker() -> ChipDescription {
        ChipDescription {
            name: String::from("Blinker"),
            inputs: vec![],
            outputs: vec![pin(0, "out")],
            sub_chips: vec![SubChipDescription::new(1, "CLOCK")],
            wires: vec![wire(1, 0, 0, 0)],
        }
    }

    fn with_steps(steps: u32) -> Arc<SimContext> {
        let mut ctx = context(vec![]);
        ctx.config.steps_per_clock_transition = steps;
        Arc::new(ctx)
    }

    #[test]
    fn test_clock_toggles_every_k_ticks() {
        let k = 5;
        let mut simulator = Simulator::from_description(&blinker(), with_steps(k)).unwrap();
        let mut previous = String::from("0");
        for tick in 1..=40u64 {
            let out = bit(&simulator.simulate(&PinValues::new()).unwrap(), 0);
            let toggled = out != previous;
            assert_eq!(toggled, tick % u64::from(k) == 0, "tick {}", tick);
            previous = out;
        }
        assert_eq!(simulator.tick_count(), 40);
    }

    #[test]
    fn test_clock_is_deterministic() {
        let edges = || {
            let mut simulator = Simulator::from_description(&blinker(), with_steps(3)).unwrap();
            (0..100)
                .map(|_| bit(&simulator.simulate(&PinValues::new()).unwrap(), 0))
                .collect::<Vec<_>>()
        };
        assert_eq!(edges(), edges());
    }

    fn bus_pair() -> ChipDescription {
        ChipDescription {
            name: String::from("BusPair"),
            inputs: vec![pin(0, "in")],
            outputs: vec![pin(1, "out")],
            sub_chips: vec![
                SubChipDescription::new(5, "NAND"),
                SubChipDescription::with_state(10, "BUS-1", vec![11]),
                SubChipDescription::with_state(11, "BUS-TERMINUS-1", vec![10]),
            ],
            wires: vec![
                wire(0, 0, 5, 0),
                wire(0, 0, 5, 1),
                wire(5, 2, 10, 0),
                wire(11, 1, 1, 1),
            ],
        }
    }

    #[test]
    fn test_bus_one_tick_latency() {
        let mut simulator = Simulator::from_description(&bus_pair(), with_steps(1)).unwrap();
        let out = bit(&run(&mut simulator, &[(0, true)]), 1);
        assert_eq!(out, "Z");
        let out = bit(&run(&mut simulator, &[(0, true)]), 1);
        assert_eq!(out, "0");

        let out = bit(&run(&mut simulator, &[(0, false)]), 1);
        assert_eq!(out, "0");
        let out = bit(&run(&mut simulator, &[(0, false)]), 1);
        assert_eq!(out, "1");
    }

    #[test]
    fn test_remove_bus_half_removes_pair() {
        let mut simulator = Simulator::from_description(&bus_pair(), with_steps(1)).unwrap();
        simulator
            .apply(Modification::RemoveChild {
                path: vec![],
                child: 10,
            })
            .unwrap();
        assert!(simulator.instance(&[10]).is_none());
        assert!(simulator.instance(&[11]).is_none());
        assert!(simulator
            .chip
            .wires()
            .iter()
            .all(|w| w.source.owner != 11 && w.target.owner != 10));
        assert_eq!(bit(&run(&mut simulator, &[(0, true)]), 1), "Z");
    }

    #[test]
    fn test_remove_origin_named_only_by_terminus() {
        let mut desc = bus_pair();
        desc.sub_chips[1] = SubChipDescription::new(10, "BUS-1");
        let mut simulator = Simulator::from_description(&desc, with_steps(1)).unwrap();
        run(&mut simulator, &[(0, false)]);
        assert_eq!(bit(&run(&mut simulator, &[(0, false)]), 1), "1");

        simulator
            .apply(Modification::RemoveChild {
                path: vec![],
                child: 10,
            })
            .unwrap();
        assert!(simulator.instance(&[10]).is_none());
        assert!(simulator.instance(&[11]).is_none());
        assert_eq!(bit(&run(&mut simulator, &[(0, false)]), 1), "Z");
    }

    #[test]
    fn test_nested_edits() {
        let outer = ChipDescription {
            name: String::from("Outer"),
            inputs: vec![pin(0, "a"), pin(1, "b")],
            outputs: vec![pin(2, "out")],
            sub_chips: vec![SubChipDescription::new(7, "And")],
            wires: vec![wire(0, 0, 7, 0), wire(1, 1, 7, 1), wire(7, 2, 2, 2)],
        };
        let mut ctx = SimContext::new(SimConfig::default(), Arc::new(EmbedLibrary));
        ctx.config.steps_per_clock_transition = 1;
        let mut simulator = Simulator::from_description(&outer, Arc::new(ctx)).unwrap();
        assert_eq!(bit(&run(&mut simulator, &[(0, true), (1, true)]), 2), "1");

        // A clock inside the nested And makes And and Outer latching.
        simulator
            .apply(Modification::AddChild {
                path: vec![7],
                child: SubChipDescription::new(30, "CLOCK"),
            })
            .unwrap();
        assert!(simulator.instance(&[7]).unwrap().is_latching());
        assert!(simulator.chip.is_latching());

        // A chip may not contain itself.
        let err = simulator
            .apply(Modification::AddChild {
                path: vec![7],
                child: SubChipDescription::new(31, "And"),
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecursiveChip(String::from("And")));

        // Removing a pin of the nested chip drops the outer wire to it.
        simulator
            .apply(Modification::RemovePin {
                path: vec![7],
                pin: 1,
            })
            .unwrap();
        assert!(!simulator
            .chip
            .wires()
            .contains(&Wire {
                source: PinAddress::boundary(1),
                target: PinAddress::new(7, 1),
            }));
        assert_valid_order(&simulator.chip);

        simulator
            .apply(Modification::AddPin {
                path: vec![7],
                direction: PinDirection::Input,
                pin: PinDescription {
                    id: 1,
                    name: String::from("b"),
                    width: BitWidth::ONE,
                },
            })
            .unwrap();
        simulator
            .apply(Modification::AddWire {
                path: vec![],
                wire: Wire {
                    source: PinAddress::boundary(1),
                    target: PinAddress::new(7, 1),
                },
            })
            .unwrap();
        assert!(simulator.instance(&[7]).unwrap().input(1).is_some());

        let err = simulator
            .apply(Modification::RemoveChild {
                path: vec![3, 4],
                child: 1,
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedPath(vec![3, 4]));
    }

    #[test]
    fn test_update_rom_contents() {
        let desc = ChipDescription {
            name: String::from("Program"),
            inputs: vec![PinDescription {
                id: 0,
                name: String::from("address"),
                width: BitWidth::EIGHT,
            }],
            outputs: vec![PinDescription {
                id: 1,
                name: String::from("word"),
                width: BitWidth::SIXTEEN,
            }],
            sub_chips: vec![SubChipDescription::new(2, "ROM-256x16")],
            wires: vec![wire(0, 0, 2, 0), wire(2, 1, 1, 1)],
        };
        let mut simulator = Simulator::from_description(&desc, with_steps(1)).unwrap();
        simulator
            .update_internal_state(&[2], vec![0, 0x1_0042, 7])
            .unwrap();
        assert_eq!(simulator.instance(&[2]).unwrap().internal_state[1], 0x42);

        let address = PinValues::from_iter([(0, PinState::from_u64(BitWidth::EIGHT, 1))]);
        let outputs = simulator.simulate(&address).unwrap();
        assert_eq!(outputs.get(1).unwrap().value_u64(), Some(0x42));

        assert!(simulator.update_internal_state(&[], vec![1]).is_err());
        assert!(simulator.update_internal_state(&[9], vec![1]).is_err());
    }

    #[test]
    fn test_rebind_key() {
        let desc = ChipDescription {
            name: String::from("Keyboard"),
            inputs: vec![],
            outputs: vec![pin(0, "pressed")],
            sub_chips: vec![SubChipDescription::new(1, "KEY")],
            wires: vec![wire(1, 0, 0, 0)],
        };
        let mut simulator = Simulator::from_description(&desc, with_steps(1)).unwrap();
        simulator
            .apply(Modification::RebindKey {
                path: vec![1],
                key: 'Q',
            })
            .unwrap();

        let mut inputs = TickInputs::default();
        inputs.keys_down.insert('Q' as u32);
        simulator.step(&inputs).unwrap();
        assert_eq!(bit(&simulator.outputs(), 0), "1");

        inputs.keys_down.clear();
        simulator.step(&inputs).unwrap();
        assert_eq!(bit(&simulator.outputs(), 0), "0");

        assert!(simulator
            .apply(Modification::RebindKey {
                path: vec![],
                key: 'Q'
            })
            .is_err());
    }

    #[test]
    fn test_driven_by_recorded() {
        let mut simulator = make_simulator("Not");
        run(&mut simulator, &[(0, true)]);
        let nand = simulator.instance(&[10]).unwrap();
        assert_eq!(nand.input(0).unwrap().driven_by, Some(PinAddress::boundary(0)));
        assert_eq!(
            simulator.chip.output(1).unwrap().driven_by,
            Some(PinAddress::new(10, 2))
        );
    }
}
