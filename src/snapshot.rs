//! Read-only copies of instance state handed to the host once per frame.

use serde::Serialize;

use crate::description::ChipType;
use crate::instance::{ChipInstance, Pin, PinAddress, Wire};

#[derive(Serialize, Clone, Debug)]
pub struct InstanceSnapshot {
    pub id: u32,
    pub name: String,
    pub chip_type: ChipType,
    pub inputs: Vec<Pin>,
    pub outputs: Vec<Pin>,
    pub internal_state: Vec<u64>,
    pub children: Vec<InstanceSnapshot>,
    pub wires: Vec<Wire>,
}

impl From<&ChipInstance> for InstanceSnapshot {
    fn from(inst: &ChipInstance) -> Self {
        InstanceSnapshot {
            id: inst.id,
            name: inst.name.clone(),
            chip_type: inst.chip_type,
            inputs: inst.inputs.clone(),
            outputs: inst.outputs.clone(),
            internal_state: inst.internal_state.clone(),
            children: inst.children().iter().map(InstanceSnapshot::from).collect(),
            wires: inst.wires().to_vec(),
        }
    }
}

impl InstanceSnapshot {
    pub fn child(&self, id: u32) -> Option<&InstanceSnapshot> {
        self.children.iter().find(|c| c.id == id)
    }

    pub fn pin(&self, id: u32) -> Option<&Pin> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|p| p.id == id)
    }
}

/// The viewed instance as of one tick.
#[derive(Serialize, Clone, Debug)]
pub struct Snapshot {
    pub tick: u64,
    pub frame: u64,
    /// Path of the viewed instance from the root.
    pub path: Vec<u32>,
    pub root: InstanceSnapshot,
}

impl Snapshot {
    pub fn new(tick: u64, frame: u64, path: Vec<u32>, inst: &ChipInstance) -> Snapshot {
        Snapshot {
            tick,
            frame,
            path,
            root: InstanceSnapshot::from(inst),
        }
    }

    /// Looks up a pin by its address inside the viewed instance.
    pub fn pin(&self, addr: PinAddress) -> Option<&Pin> {
        if addr.owner == addr.pin {
            if let Some(p) = self.root.pin(addr.pin) {
                return Some(p);
            }
        }
        self.root.child(addr.owner)?.pin(addr.pin)
    }

    pub fn child(&self, id: u32) -> Option<&InstanceSnapshot> {
        self.root.child(id)
    }

    /// Walks a path of child IDs down from the viewed instance.
    pub fn find(&self, path: &[u32]) -> Option<&InstanceSnapshot> {
        let mut current = &self.root;
        for id in path {
            current = current.child(*id)?;
        }
        Some(current)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::description::{ChipDescription, SubChipDescription};
    use crate::netlist::test::{context, pin, wire};
    use crate::netlist::NetlistBuilder;

    #[test]
    fn test_snapshot_lookups() {
        let desc = ChipDescription {
            name: String::from("Lamp"),
            inputs: vec![pin(0, "on")],
            outputs: vec![],
            sub_chips: vec![SubChipDescription::new(3, "LED")],
            wires: vec![wire(0, 0, 3, 0)],
        };
        let ctx = context(vec![]);
        let inst = NetlistBuilder::new(&ctx).build(&desc).unwrap();
        let snapshot = Snapshot::new(12, 4, vec![], &inst);

        assert_eq!(snapshot.tick, 12);
        assert_eq!(snapshot.pin(PinAddress::boundary(0)).unwrap().name, "on");
        assert_eq!(snapshot.pin(PinAddress::new(3, 0)).unwrap().name, "in");
        assert!(snapshot.pin(PinAddress::new(4, 0)).is_none());
        for w in &snapshot.root.wires {
            assert!(snapshot.pin(w.source).is_some());
            assert!(snapshot.pin(w.target).is_some());
        }
        assert_eq!(snapshot.find(&[3]).unwrap().chip_type, ChipType::Led);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["root"]["children"][0]["inputs"][0]["state"], "Z");
    }
}
