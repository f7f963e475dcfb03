use std::fmt;

use serde::{Deserialize, Serialize};

use crate::description::{ChipType, PinDescription};
use crate::signal::{BitWidth, PinState};

/// Addresses a pin inside one composite chip. Boundary pins of the composite
/// use their own pin ID as the owner ID, pins of children use the child's
/// instance ID.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PinAddress {
    pub owner: u32,
    pub pin: u32,
}

impl PinAddress {
    pub fn new(owner: u32, pin: u32) -> PinAddress {
        PinAddress { owner, pin }
    }

    /// Address of a boundary pin of the enclosing composite.
    pub fn boundary(pin: u32) -> PinAddress {
        PinAddress { owner: pin, pin }
    }
}

impl fmt::Display for PinAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.owner, self.pin)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinDirection {
    Input,
    Output,
}

#[derive(Serialize, Clone, Debug)]
pub struct Pin {
    pub id: u32,
    pub name: String,
    pub direction: PinDirection,
    pub state: PinState,
    /// The upstream pin that last wrote this one. Display and diagnostics only.
    pub driven_by: Option<PinAddress>,
}

impl Pin {
    pub fn new(desc: &PinDescription, direction: PinDirection) -> Pin {
        Pin {
            id: desc.id,
            name: desc.name.clone(),
            direction,
            state: PinState::floating(desc.width),
            driven_by: None,
        }
    }

    pub fn width(&self) -> BitWidth {
        self.state.width()
    }
}

/// A directed connection between two pins of one composite.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Wire {
    pub source: PinAddress,
    pub target: PinAddress,
}

/// Where a resolved wire delivers its value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Endpoint {
    ChildInput { child: usize, pin: usize },
    BoundaryOutput { pin: usize },
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Route {
    pub pin: usize,
    pub source: PinAddress,
    pub target: Endpoint,
}

/// Wires compiled against the current child order. Indices go stale whenever
/// children or pins move, so routes are rebuilt with the order.
#[derive(Clone, Debug, Default)]
pub(crate) struct Routes {
    pub from_boundary: Vec<Route>,
    pub from_children: Vec<Vec<Route>>,
}

/// An executable instance of a chip. Composite (custom) instances own their
/// children in execution order.
#[derive(Clone, Debug)]
pub struct ChipInstance {
    pub id: u32,
    pub name: String,
    pub chip_type: ChipType,
    pub inputs: Vec<Pin>,
    pub outputs: Vec<Pin>,
    pub internal_state: Vec<u64>,
    pub(crate) children: Vec<ChipInstance>,
    pub(crate) wires: Vec<Wire>,
    pub(crate) latching: bool,
    pub(crate) routes: Routes,
}

impl ChipInstance {
    pub fn children(&self) -> &[ChipInstance] {
        &self.children
    }

    pub fn wires(&self) -> &[Wire] {
        &self.wires
    }

    /// True when outputs depend on latched state rather than only on this
    /// tick's inputs. Latching instances break cycles in the execution order.
    pub fn is_latching(&self) -> bool {
        self.latching
    }

    pub fn child(&self, id: u32) -> Option<&ChipInstance> {
        self.children.iter().find(|c| c.id == id)
    }

    pub(crate) fn child_mut(&mut self, id: u32) -> Option<&mut ChipInstance> {
        self.children.iter_mut().find(|c| c.id == id)
    }

    pub(crate) fn child_index(&self, id: u32) -> Option<usize> {
        self.children.iter().position(|c| c.id == id)
    }

    pub fn input(&self, id: u32) -> Option<&Pin> {
        self.inputs.iter().find(|p| p.id == id)
    }

    pub fn output(&self, id: u32) -> Option<&Pin> {
        self.outputs.iter().find(|p| p.id == id)
    }

    pub fn pin(&self, id: u32) -> Option<&Pin> {
        self.input(id).or_else(|| self.output(id))
    }

    /// Looks up a pin by its address inside this composite.
    pub fn pin_at(&self, address: PinAddress) -> Option<&Pin> {
        if address.owner == address.pin {
            if let Some(p) = self.pin(address.pin) {
                return Some(p);
            }
        }
        self.child(address.owner)?.pin(address.pin)
    }

    /// Walks a path of child IDs down from this instance.
    pub fn find(&self, path: &[u32]) -> Option<&ChipInstance> {
        let mut current = self;
        for id in path {
            current = current.child(*id)?;
        }
        Some(current)
    }

    pub(crate) fn find_mut(&mut self, path: &[u32]) -> Option<&mut ChipInstance> {
        let mut current = self;
        for id in path {
            current = current.child_mut(*id)?;
        }
        Some(current)
    }

    /// True if some boundary pin or child already uses `id`.
    pub(crate) fn id_in_use(&self, id: u32) -> bool {
        self.pin(id).is_some() || self.child(id).is_some()
    }

    /// Total number of instances in this subtree, this one included.
    pub fn instance_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|c| c.instance_count())
            .sum::<usize>()
    }
}
