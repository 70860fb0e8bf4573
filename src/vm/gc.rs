//! Root enumeration for the collector.
//!
//! The operand stacks hold uncounted references, so a collection must start
//! from everything the VM itself can still reach: every frame, the global and
//! module tables, and the pinned constants of each loaded program.

use super::heap::HeapId;
use super::vm::Vm;

impl Vm {
    pub(crate) fn roots(&self) -> Vec<HeapId> {
        let mut roots = Vec::with_capacity(self.globals.len() + self.frames.len() * 8);
        for frame in &self.frames {
            frame.roots(&mut roots);
        }
        roots.extend(self.globals.values().filter_map(|v| v.heap_id()));
        roots.extend(self.modules.values().filter_map(|v| v.heap_id()));
        for unit in &self.units {
            roots.extend(unit.constants.iter().filter_map(|v| v.heap_id()));
        }
        roots
    }
}
