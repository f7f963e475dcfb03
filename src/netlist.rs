//! Turns chip descriptions into executable instance trees and keeps each
//! composite's child list in a valid execution order as it is edited.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::builtin::{self, BUS_IN, BUS_OUT, UNLINKED};
use crate::config::{SimConfig, SimContext};
use crate::description::{
    ChipDescription, ChipType, PinDescription, SubChipDescription, WireDescription,
};
use crate::error::{ErrorKind, Result, SimError};
use crate::instance::{
    ChipInstance, Endpoint, Pin, PinAddress, PinDirection, Route, Routes, Wire,
};
use crate::library::{resolve, Resolved};
use crate::signal::PinState;

pub struct NetlistBuilder<'a> {
    ctx: &'a SimContext,
    /// Names of the custom chips being built, outermost first.
    stack: Vec<String>,
}

impl<'a> NetlistBuilder<'a> {
    pub fn new(ctx: &'a SimContext) -> NetlistBuilder<'a> {
        NetlistBuilder {
            ctx,
            stack: Vec::new(),
        }
    }

    /// A builder that treats `ancestors` as already being built, so adding a
    /// chip inside itself is still caught.
    pub(crate) fn with_ancestors(ctx: &'a SimContext, ancestors: Vec<String>) -> NetlistBuilder<'a> {
        NetlistBuilder {
            ctx,
            stack: ancestors,
        }
    }

    /// Builds the root instance of `desc`.
    pub fn build(&mut self, desc: &ChipDescription) -> Result<ChipInstance> {
        self.build_custom(0, desc)
    }

    /// Builds `desc`, or on failure logs the error and returns an instance
    /// with the same pins and nothing inside.
    pub fn build_or_blank(&mut self, desc: &ChipDescription) -> ChipInstance {
        match self.build(desc) {
            Ok(inst) => inst,
            Err(e) => {
                log::error!("Unable to build {}: {}", desc.name, e);
                self.stack.clear();
                let (inputs, outputs) = boundary_pins(desc).unwrap_or_default();
                custom_instance(0, &desc.name, inputs, outputs, Vec::new())
            }
        }
    }

    /// Builds the root instance of the chip called `name`, built-in or from
    /// the library.
    pub fn build_named(&mut self, name: &str) -> Result<ChipInstance> {
        self.instantiate(&SubChipDescription::new(0, name))
    }

    fn instantiate(&mut self, sub: &SubChipDescription) -> Result<ChipInstance> {
        match resolve(&sub.name, self.ctx.library.as_ref())? {
            Resolved::Builtin(chip_type) => Ok(builtin_instance(
                sub.id,
                chip_type,
                &sub.internal_state,
                &self.ctx.config,
            )),
            Resolved::Custom(desc) => self.build_custom(sub.id, &desc),
        }
    }

    fn build_custom(&mut self, id: u32, desc: &ChipDescription) -> Result<ChipInstance> {
        if self.stack.iter().any(|n| *n == desc.name) {
            return Err(SimError::new(
                ErrorKind::RecursiveChip(desc.name.clone()),
                format!(
                    "{} contains itself through {}",
                    desc.name,
                    self.stack.join(" > ")
                ),
            ));
        }

        let (inputs, outputs) = boundary_pins(desc)?;
        let mut ids: HashSet<u32> = inputs.iter().chain(outputs.iter()).map(|p| p.id).collect();
        for sub in &desc.sub_chips {
            if !ids.insert(sub.id) {
                return Err(duplicate_id(&desc.name, sub.id));
            }
        }

        self.stack.push(desc.name.clone());
        let children: Result<Vec<ChipInstance>> = desc
            .sub_chips
            .iter()
            .map(|sub| self.instantiate(sub))
            .collect();
        self.stack.pop();

        let mut inst = custom_instance(id, &desc.name, inputs, outputs, children?);
        connect(&mut inst, &desc.wires);
        link_buses(&mut inst);
        recompute(&mut inst);

        log::debug!(
            "Built {} #{} with {} children and {} wires",
            inst.name,
            inst.id,
            inst.children.len(),
            inst.wires.len()
        );
        Ok(inst)
    }

    /// Adds a child built from `sub` to the composite `parent` and reorders
    /// that composite. Nothing else is rebuilt.
    pub fn add_child(&mut self, parent: &mut ChipInstance, sub: &SubChipDescription) -> Result<()> {
        require_custom(parent)?;
        if parent.id_in_use(sub.id) {
            return Err(duplicate_id(&parent.name, sub.id));
        }

        self.stack.push(parent.name.clone());
        let child = self.instantiate(sub);
        self.stack.pop();
        let child = child?;

        let chip_type = child.chip_type;
        parent.children.push(child);
        if chip_type.is_bus() {
            link_buses(parent);
        }
        recompute(parent);
        log::debug!("Added {} #{} to {}", sub.name, sub.id, parent.name);
        Ok(())
    }
}

fn duplicate_id(chip: &str, id: u32) -> SimError {
    SimError::new(
        ErrorKind::DuplicateId(id),
        format!("ID {} is used more than once in {}", id, chip),
    )
}

fn require_custom(inst: &ChipInstance) -> Result<()> {
    if inst.chip_type == ChipType::Custom {
        Ok(())
    } else {
        Err(SimError::new(
            ErrorKind::Other,
            format!("{} #{} is a built-in chip and cannot be edited", inst.name, inst.id),
        ))
    }
}

fn boundary_pins(desc: &ChipDescription) -> Result<(Vec<Pin>, Vec<Pin>)> {
    let mut seen = HashSet::new();
    for p in desc.inputs.iter().chain(desc.outputs.iter()) {
        if !seen.insert(p.id) {
            return Err(duplicate_id(&desc.name, p.id));
        }
    }
    let pins = |descs: &[PinDescription], direction| {
        descs.iter().map(|p| Pin::new(p, direction)).collect::<Vec<Pin>>()
    };
    Ok((
        pins(&desc.inputs, PinDirection::Input),
        pins(&desc.outputs, PinDirection::Output),
    ))
}

fn custom_instance(
    id: u32,
    name: &str,
    inputs: Vec<Pin>,
    outputs: Vec<Pin>,
    children: Vec<ChipInstance>,
) -> ChipInstance {
    ChipInstance {
        id,
        name: String::from(name),
        chip_type: ChipType::Custom,
        inputs,
        outputs,
        internal_state: Vec::new(),
        children,
        wires: Vec::new(),
        latching: false,
        routes: Routes::default(),
    }
}

fn builtin_instance(
    id: u32,
    chip_type: ChipType,
    declared: &[u64],
    config: &SimConfig,
) -> ChipInstance {
    let (inputs, outputs) = builtin::pins(chip_type);
    ChipInstance {
        id,
        name: chip_type.name(),
        chip_type,
        inputs: inputs.iter().map(|p| Pin::new(p, PinDirection::Input)).collect(),
        outputs: outputs.iter().map(|p| Pin::new(p, PinDirection::Output)).collect(),
        internal_state: builtin::initial_state(chip_type, declared, config),
        children: Vec::new(),
        wires: Vec::new(),
        latching: chip_type.is_latching(),
        routes: Routes::default(),
    }
}

/// A pin that may drive a wire: a boundary input or a child output.
fn source_pin(inst: &ChipInstance, addr: PinAddress) -> Option<&Pin> {
    if addr.owner == addr.pin {
        if let Some(p) = inst.input(addr.pin) {
            return Some(p);
        }
    }
    inst.child(addr.owner)?.output(addr.pin)
}

/// A pin that may be driven by a wire: a boundary output or a child input.
fn target_pin(inst: &ChipInstance, addr: PinAddress) -> Option<&Pin> {
    if addr.owner == addr.pin {
        if let Some(p) = inst.output(addr.pin) {
            return Some(p);
        }
    }
    inst.child(addr.owner)?.input(addr.pin)
}

fn target_pin_mut(inst: &mut ChipInstance, addr: PinAddress) -> Option<&mut Pin> {
    if addr.owner == addr.pin {
        if let Some(i) = inst.outputs.iter().position(|p| p.id == addr.pin) {
            return Some(&mut inst.outputs[i]);
        }
    }
    inst.child_mut(addr.owner)?
        .inputs
        .iter_mut()
        .find(|p| p.id == addr.pin)
}

/// Checks that both ends of `wire` exist in `inst` and have equal widths.
pub fn check_wire(inst: &ChipInstance, wire: &Wire) -> Result<()> {
    let missing = |addr: PinAddress, role: &str| {
        SimError::new(
            ErrorKind::UnresolvedPin(addr),
            format!("No {} pin at {} in {}", role, addr, inst.name),
        )
    };
    let source = source_pin(inst, wire.source).ok_or_else(|| missing(wire.source, "source"))?;
    let target = target_pin(inst, wire.target).ok_or_else(|| missing(wire.target, "target"))?;
    if source.width() != target.width() {
        return Err(SimError::width_mismatch(
            target.width().bits(),
            source.width().bits(),
        ));
    }
    Ok(())
}

/// Materializes declared wires, dropping the ones that do not resolve.
fn connect(inst: &mut ChipInstance, wires: &[WireDescription]) {
    // Source each declared wire ended up with, None if dropped.
    let mut sources: Vec<Option<PinAddress>> = Vec::with_capacity(wires.len());

    for (i, desc) in wires.iter().enumerate() {
        let source = match desc.branch_of {
            None => desc.source,
            Some(j) if j < i => match sources[j] {
                Some(s) => s,
                None => {
                    log::warn!(
                        "Wire {} in {} branches from dropped wire {}, connecting it from {}",
                        i,
                        inst.name,
                        j,
                        desc.source
                    );
                    desc.source
                }
            },
            Some(j) => {
                log::warn!(
                    "Wire {} in {} branches from later wire {}, connecting it from {}",
                    i,
                    inst.name,
                    j,
                    desc.source
                );
                desc.source
            }
        };

        let wire = Wire {
            source,
            target: desc.target,
        };
        match check_wire(inst, &wire) {
            Ok(()) => {
                if !inst.wires.contains(&wire) {
                    inst.wires.push(wire);
                }
                sources.push(Some(source));
            }
            Err(e) => {
                log::warn!("Dropping wire {} -> {} in {}: {}", wire.source, wire.target, inst.name, e);
                sources.push(None);
            }
        }
    }
}

/// Connects the bus terminus `terminus` to its origin sibling. The origin is
/// the one the terminus names, or failing that one naming the terminus. Both
/// halves end up naming each other.
fn link_bus(inst: &mut ChipInstance, terminus: u32) {
    let (width, partner) = match inst.child(terminus) {
        Some(ChipInstance {
            chip_type: ChipType::BusTerminus { width },
            internal_state,
            ..
        }) => (*width, internal_state.first().copied().unwrap_or(UNLINKED)),
        _ => return,
    };

    let is_origin = |c: &ChipInstance| c.chip_type == ChipType::BusOrigin { width };
    let origin = u32::try_from(partner)
        .ok()
        .and_then(|p| inst.child(p))
        .filter(|o| is_origin(o))
        .or_else(|| {
            inst.children
                .iter()
                .find(|c| is_origin(c) && c.internal_state.first() == Some(&u64::from(terminus)))
        })
        .map(|o| o.id);

    match origin {
        Some(origin) => {
            for (half, partner) in [(origin, terminus), (terminus, origin)] {
                if let Some(child) = inst.child_mut(half) {
                    child.internal_state = vec![u64::from(partner)];
                }
            }
            let wire = Wire {
                source: PinAddress::new(origin, BUS_OUT),
                target: PinAddress::new(terminus, BUS_IN),
            };
            if !inst.wires.contains(&wire) {
                inst.wires.push(wire);
            }
        }
        None => log::warn!(
            "Bus terminus #{} in {} has no {}-bit origin #{}, its output stays floating",
            terminus,
            inst.name,
            width,
            partner
        ),
    }
}

fn link_buses(inst: &mut ChipInstance) {
    let termini: Vec<u32> = inst
        .children
        .iter()
        .filter(|c| matches!(c.chip_type, ChipType::BusTerminus { .. }))
        .map(|c| c.id)
        .collect();
    for t in termini {
        link_bus(inst, t);
    }
}

/// Replaces every origin-to-terminus link in `inst` with the links the
/// current partner words ask for.
pub(crate) fn relink_buses(inst: &mut ChipInstance) {
    let origins: HashSet<u32> = inst
        .children
        .iter()
        .filter(|c| matches!(c.chip_type, ChipType::BusOrigin { .. }))
        .map(|c| c.id)
        .collect();
    let termini: HashSet<u32> = inst
        .children
        .iter()
        .filter(|c| matches!(c.chip_type, ChipType::BusTerminus { .. }))
        .map(|c| c.id)
        .collect();
    remove_wires_where(inst, |w| {
        origins.contains(&w.source.owner)
            && w.source.pin == BUS_OUT
            && termini.contains(&w.target.owner)
            && w.target.pin == BUS_IN
    });
    link_buses(inst);
    recompute(inst);
}

/// Removes matching wires. Targets left with no driver go back to floating.
fn remove_wires_where(inst: &mut ChipInstance, pred: impl Fn(&Wire) -> bool) -> Vec<Wire> {
    let (removed, kept): (Vec<Wire>, Vec<Wire>) =
        std::mem::take(&mut inst.wires).into_iter().partition(|w| pred(w));
    inst.wires = kept;

    for wire in &removed {
        if inst.wires.iter().any(|w| w.target == wire.target) {
            continue;
        }
        if let Some(pin) = target_pin_mut(inst, wire.target) {
            pin.state = PinState::floating(pin.width());
            pin.driven_by = None;
        }
    }
    removed
}

/// Execution order of `children` as indices into the slice.
///
/// Edges run from a child driving another child's input. Edges into latching
/// children are ignored, so latching children have no predecessors and come
/// first. Ties go to the lower child ID. Children on a combinational cycle
/// are kept together, ordered by ID.
pub fn compute_order(children: &[ChipInstance], wires: &[Wire]) -> Vec<usize> {
    let index: HashMap<u32, usize> = children.iter().enumerate().map(|(i, c)| (c.id, i)).collect();

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..children.len()).map(|i| graph.add_node(i)).collect();
    for wire in wires {
        let (s, t) = match (index.get(&wire.source.owner), index.get(&wire.target.owner)) {
            (Some(s), Some(t)) => (*s, *t),
            _ => continue,
        };
        if s == t || children[t].latching {
            continue;
        }
        graph.update_edge(nodes[s], nodes[t], ());
    }

    let sccs = kosaraju_scc(&graph);
    let mut component = vec![0; children.len()];
    for (c, scc) in sccs.iter().enumerate() {
        for node in scc {
            component[graph[*node]] = c;
        }
    }

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); sccs.len()];
    let mut indegree = vec![0usize; sccs.len()];
    for edge in graph.edge_references() {
        let a = component[graph[edge.source()]];
        let b = component[graph[edge.target()]];
        if a != b && successors[a].insert(b) {
            indegree[b] += 1;
        }
    }

    let key = |c: usize| {
        let members = &sccs[c];
        let latching = members.len() == 1 && children[graph[members[0]]].latching;
        let min_id = members
            .iter()
            .map(|n| children[graph[*n]].id)
            .min()
            .unwrap_or(u32::MAX);
        Reverse((u8::from(!latching), min_id, c))
    };

    let mut ready: BinaryHeap<_> = (0..sccs.len()).filter(|c| indegree[*c] == 0).map(key).collect();
    let mut order = Vec::with_capacity(children.len());
    while let Some(Reverse((_, _, c))) = ready.pop() {
        let mut members: Vec<usize> = sccs[c].iter().map(|n| graph[*n]).collect();
        members.sort_by_key(|i| children[*i].id);
        order.extend(members);

        for s in &successors[c] {
            indegree[*s] -= 1;
            if indegree[*s] == 0 {
                ready.push(key(*s));
            }
        }
    }
    order
}

/// Resolves wires to pin positions under the current child order.
fn compile_routes(inst: &ChipInstance) -> Routes {
    let mut routes = Routes {
        from_boundary: Vec::new(),
        from_children: vec![Vec::new(); inst.children.len()],
    };
    let position = |pins: &[Pin], id| pins.iter().position(|p: &Pin| p.id == id);

    for wire in &inst.wires {
        let boundary_target = if wire.target.owner == wire.target.pin {
            position(&inst.outputs, wire.target.pin)
        } else {
            None
        };
        let target = match boundary_target {
            Some(pin) => Endpoint::BoundaryOutput { pin },
            None => {
                let found = inst.child_index(wire.target.owner).and_then(|child| {
                    position(&inst.children[child].inputs, wire.target.pin)
                        .map(|pin| Endpoint::ChildInput { child, pin })
                });
                match found {
                    Some(t) => t,
                    None => {
                        log::debug!("Wire target {} in {} is gone", wire.target, inst.name);
                        continue;
                    }
                }
            }
        };

        let boundary_source = if wire.source.owner == wire.source.pin {
            position(&inst.inputs, wire.source.pin)
        } else {
            None
        };
        if let Some(pin) = boundary_source {
            routes.from_boundary.push(Route {
                pin,
                source: wire.source,
                target,
            });
            continue;
        }
        let found = inst.child_index(wire.source.owner).and_then(|child| {
            position(&inst.children[child].outputs, wire.source.pin).map(|pin| (child, pin))
        });
        match found {
            Some((child, pin)) => routes.from_children[child].push(Route {
                pin,
                source: wire.source,
                target,
            }),
            None => log::debug!("Wire source {} in {} is gone", wire.source, inst.name),
        }
    }
    routes
}

/// Reorders the children of one composite and recompiles its routes.
pub(crate) fn recompute(inst: &mut ChipInstance) {
    if inst.chip_type != ChipType::Custom {
        return;
    }
    let order = compute_order(&inst.children, &inst.wires);
    let mut slots: Vec<Option<ChipInstance>> =
        std::mem::take(&mut inst.children).into_iter().map(Some).collect();
    inst.children = order.iter().filter_map(|i| slots[*i].take()).collect();
    inst.latching = inst.children.iter().any(|c| c.latching);
    inst.routes = compile_routes(inst);

    log::debug!(
        "Execution order of {}: {:?}",
        inst.name,
        inst.children.iter().map(|c| c.id).collect::<Vec<_>>()
    );
}

/// Removes child `id`, and its bus partner if it has one. Returns the IDs
/// removed.
pub fn remove_child(inst: &mut ChipInstance, id: u32) -> Result<Vec<u32>> {
    require_custom(inst)?;
    let child = inst.child(id).ok_or_else(|| {
        SimError::new(
            ErrorKind::UnresolvedPath(vec![id]),
            format!("{} has no child #{}", inst.name, id),
        )
    })?;

    // A bus half goes with every opposite half it names or that names it.
    let mut removed = vec![id];
    if child.chip_type.is_bus() {
        let chip_type = child.chip_type;
        let partner = child.internal_state.first().copied();
        for sibling in &inst.children {
            if sibling.id == id || !sibling.chip_type.is_bus() || sibling.chip_type == chip_type {
                continue;
            }
            let named = partner == Some(u64::from(sibling.id));
            let names = sibling.internal_state.first() == Some(&u64::from(id));
            if named || names {
                removed.push(sibling.id);
            }
        }
    }

    inst.children.retain(|c| !removed.contains(&c.id));
    remove_wires_where(inst, |w| {
        removed.contains(&w.source.owner) || removed.contains(&w.target.owner)
    });
    recompute(inst);
    log::debug!("Removed {:?} from {}", removed, inst.name);
    Ok(removed)
}

pub fn add_pin(inst: &mut ChipInstance, direction: PinDirection, desc: &PinDescription) -> Result<()> {
    require_custom(inst)?;
    if inst.id_in_use(desc.id) {
        return Err(duplicate_id(&inst.name, desc.id));
    }
    let pin = Pin::new(desc, direction);
    match direction {
        PinDirection::Input => inst.inputs.push(pin),
        PinDirection::Output => inst.outputs.push(pin),
    }
    recompute(inst);
    Ok(())
}

/// Removes boundary pin `id` together with every wire touching it.
pub fn remove_pin(inst: &mut ChipInstance, id: u32) -> Result<()> {
    require_custom(inst)?;
    if let Some(i) = inst.inputs.iter().position(|p| p.id == id) {
        inst.inputs.remove(i);
    } else if let Some(i) = inst.outputs.iter().position(|p| p.id == id) {
        inst.outputs.remove(i);
    } else {
        return Err(SimError::new(
            ErrorKind::UnresolvedPin(PinAddress::boundary(id)),
            format!("{} has no pin {}", inst.name, id),
        ));
    }
    let addr = PinAddress::boundary(id);
    remove_wires_where(inst, |w| w.source == addr || w.target == addr);
    recompute(inst);
    Ok(())
}

/// Drops the wires of `inst` that touch pin `pin` of child `child`, after
/// that pin was removed from the child.
pub(crate) fn remove_child_pin_wires(inst: &mut ChipInstance, child: u32, pin: u32) {
    let addr = PinAddress::new(child, pin);
    let removed = remove_wires_where(inst, |w| w.source == addr || w.target == addr);
    if !removed.is_empty() {
        recompute(inst);
    }
}

pub fn add_wire(inst: &mut ChipInstance, wire: Wire) -> Result<()> {
    require_custom(inst)?;
    check_wire(inst, &wire)?;
    if inst.wires.contains(&wire) {
        log::debug!("Wire {} -> {} already exists in {}", wire.source, wire.target, inst.name);
        return Ok(());
    }
    inst.wires.push(wire);
    recompute(inst);
    Ok(())
}

pub fn remove_wire(inst: &mut ChipInstance, source: PinAddress, target: PinAddress) -> Result<()> {
    require_custom(inst)?;
    let removed = remove_wires_where(inst, |w| w.source == source && w.target == target);
    if removed.is_empty() {
        return Err(SimError::new(
            ErrorKind::UnresolvedPin(target),
            format!("No wire from {} to {} in {}", source, target, inst.name),
        ));
    }
    recompute(inst);
    Ok(())
}
