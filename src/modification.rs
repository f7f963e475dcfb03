//! Structural edits requested from outside the simulation thread.
//!
//! Hosts push [`Modification`]s into a [`ModificationQueue`] from any thread.
//! The driver drains the whole queue at the top of each loop iteration and
//! applies the batch between two ticks, so a tick never sees a half-applied
//! edit.

use std::sync::mpsc::{self, Receiver, Sender};

use serde::{Deserialize, Serialize};

use crate::description::{PinDescription, SubChipDescription};
use crate::error::{ErrorKind, Result, SimError};
use crate::instance::{PinAddress, PinDirection, Wire};

/// One edit. `path` is a list of child IDs from the root. Pin, child and
/// wire edits address the composite being edited, state edits address the
/// instance itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op")]
pub enum Modification {
    AddPin {
        path: Vec<u32>,
        direction: PinDirection,
        pin: PinDescription,
    },
    RemovePin {
        path: Vec<u32>,
        pin: u32,
    },
    AddChild {
        path: Vec<u32>,
        child: SubChipDescription,
    },
    /// Removing one half of a bus removes the other half too.
    RemoveChild {
        path: Vec<u32>,
        child: u32,
    },
    AddWire {
        path: Vec<u32>,
        wire: Wire,
    },
    RemoveWire {
        path: Vec<u32>,
        source: PinAddress,
        target: PinAddress,
    },
    RebindKey {
        path: Vec<u32>,
        key: char,
    },
    /// Replaces internal-state words: ROM contents, pulse width, bus partner.
    SetInternalState {
        path: Vec<u32>,
        state: Vec<u64>,
    },
}

impl Modification {
    pub fn path(&self) -> &[u32] {
        match self {
            Modification::AddPin { path, .. }
            | Modification::RemovePin { path, .. }
            | Modification::AddChild { path, .. }
            | Modification::RemoveChild { path, .. }
            | Modification::AddWire { path, .. }
            | Modification::RemoveWire { path, .. }
            | Modification::RebindKey { path, .. }
            | Modification::SetInternalState { path, .. } => path,
        }
    }
}

/// Sending half, cloneable and shareable between host threads.
#[derive(Clone, Debug)]
pub struct ModificationQueue {
    sender: Sender<Modification>,
}

impl ModificationQueue {
    /// Enqueues without blocking. Fails only once the simulation is gone.
    pub fn push(&self, modification: Modification) -> Result<()> {
        self.sender.send(modification).map_err(|e| {
            SimError::new(
                ErrorKind::Other,
                format!("Simulation has stopped, dropping {:?}", e.0),
            )
        })
    }
}

/// Receiving half, owned by the thread that owns the simulator.
#[derive(Debug)]
pub struct ModificationReceiver {
    receiver: Receiver<Modification>,
}

impl ModificationReceiver {
    /// Everything queued so far, in the order it was pushed.
    pub fn drain(&self) -> Vec<Modification> {
        self.receiver.try_iter().collect()
    }
}

pub fn channel() -> (ModificationQueue, ModificationReceiver) {
    let (sender, receiver) = mpsc::channel();
    (
        ModificationQueue { sender },
        ModificationReceiver { receiver },
    )
}
