//! The object heap: a generational slab of refcounted, collectable cells.
//!
//! Reference counts track *ownership*: bindings in locals and globals, host
//! pins, and the owned children of containers that are themselves counted.
//! A container contributes to its children's counts only while its own
//! count is positive, so counts rise and fall recursively on the 0/1
//! transitions. Nothing is freed by reference counting alone; memory is
//! reclaimed by [`Heap::collect`], which frees an object only when it is
//! both unmarked by the trace and has a count of zero or less.

use crate::error::InternalError;

use super::value::{HeapData, StrObject, Value};

/// Handle to a heap cell. The generation makes handles to freed cells
/// detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId {
    index: u32,
    generation: u32,
}

impl HeapId {
    pub fn index(self) -> u32 {
        self.index
    }

    fn dangling(self) -> InternalError {
        InternalError::DanglingHandle {
            index: self.index,
            generation: self.generation,
        }
    }
}

/// A live heap cell.
#[derive(Debug)]
pub struct HeapObject {
    pub refcount: i32,
    pub marked: bool,
    pub data: HeapData,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

/// Statistics from one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub freed: usize,
    pub live: usize,
    /// Unreachable objects whose counts were held up by reference cycles.
    pub cycles_broken: usize,
    pub next_threshold: usize,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    threshold: usize,
    collections: usize,
}

impl Heap {
    pub fn new(threshold: usize) -> Self {
        Self {
            slots: Vec::with_capacity(threshold.min(4096)),
            free: Vec::new(),
            live: 0,
            threshold: threshold.max(1),
            collections: 0,
        }
    }

    /// Allocate a cell with a reference count of zero.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        let object = HeapObject {
            refcount: 0,
            marked: false,
            data,
        };
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            return HeapId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        HeapId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    pub fn alloc_str(&mut self, text: &str) -> Value {
        Value::Ref(self.alloc(HeapData::Str(StrObject::new(text))))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.alloc(HeapData::Array(items)))
    }

    pub fn get(&self, id: HeapId) -> Result<&HeapObject, InternalError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.object.as_ref())
            .ok_or_else(|| id.dangling())
    }

    pub fn get_mut(&mut self, id: HeapId) -> Result<&mut HeapObject, InternalError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.object.as_mut())
            .ok_or_else(|| id.dangling())
    }

    pub fn data(&self, id: HeapId) -> Result<&HeapData, InternalError> {
        Ok(&self.get(id)?.data)
    }

    pub fn data_mut(&mut self, id: HeapId) -> Result<&mut HeapData, InternalError> {
        Ok(&mut self.get_mut(id)?.data)
    }

    pub fn refcount(&self, id: HeapId) -> Result<i32, InternalError> {
        Ok(self.get(id)?.refcount)
    }

    pub fn is_live(&self, id: HeapId) -> bool {
        self.get(id).is_ok()
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    pub fn should_collect(&self) -> bool {
        self.live >= self.threshold
    }

    /// Take a reference. On a 0 → 1 transition the object starts owning its
    /// children.
    pub fn inc_ref(&mut self, value: Value) -> Result<(), InternalError> {
        let Some(id) = value.heap_id() else {
            return Ok(());
        };
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let object = self.get_mut(id)?;
            object.refcount += 1;
            if object.refcount == 1 {
                object.data.owned_children(&mut work);
            }
        }
        Ok(())
    }

    /// Drop a reference. On a 1 → 0 transition the object releases its
    /// children. Never frees.
    pub fn dec_ref(&mut self, value: Value) -> Result<(), InternalError> {
        let Some(id) = value.heap_id() else {
            return Ok(());
        };
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let object = self.get_mut(id)?;
            if object.refcount <= 0 {
                return Err(InternalError::Corrupt(format!(
                    "reference count underflow on #{}",
                    id.index
                )));
            }
            object.refcount -= 1;
            if object.refcount == 0 {
                object.data.owned_children(&mut work);
            }
        }
        Ok(())
    }

    /// Account for `container` replacing `old` with `new` in one of its
    /// owned slots. Either side may be absent (insertions and removals).
    pub fn retarget(
        &mut self,
        container: HeapId,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<(), InternalError> {
        if self.refcount(container)? <= 0 {
            return Ok(());
        }
        if let Some(new) = new {
            self.inc_ref(new)?;
        }
        if let Some(old) = old {
            self.dec_ref(old)?;
        }
        Ok(())
    }

    // --- Collection ---

    /// Mark everything reachable from `roots`.
    pub fn mark(&mut self, roots: &[HeapId]) -> Result<(), InternalError> {
        let mut work = roots.to_vec();
        while let Some(id) = work.pop() {
            let object = self.get_mut(id)?;
            if object.marked {
                continue;
            }
            object.marked = true;
            object.data.traced_children(&mut work);
        }
        Ok(())
    }

    fn live_object(&self, id: HeapId) -> Option<&HeapObject> {
        self.get(id).ok()
    }

    fn id_at(&self, index: usize) -> HeapId {
        HeapId {
            index: index as u32,
            generation: self.slots[index].generation,
        }
    }

    /// Discount references that unmarked objects hold on each other.
    ///
    /// Unmarked objects still counted from outside the heap (host pins) are
    /// kept and marked along with everything they reach. The rest are
    /// garbage: their contributions to other garbage are subtracted and
    /// their contributions to marked objects released, which leaves every
    /// garbage count at zero.
    fn break_cycles(&mut self) -> Result<usize, InternalError> {
        let mut internal = vec![0i32; self.slots.len()];
        let mut children = Vec::new();
        for slot in &self.slots {
            let Some(object) = &slot.object else { continue };
            if object.marked || object.refcount <= 0 {
                continue;
            }
            children.clear();
            object.data.owned_children(&mut children);
            for child in &children {
                if let Some(target) = self.live_object(*child) {
                    if !target.marked {
                        internal[child.index as usize] += 1;
                    }
                }
            }
        }

        let held: Vec<HeapId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let object = slot.object.as_ref()?;
                (!object.marked && object.refcount - internal[index] > 0).then_some(index)
            })
            .map(|index| self.id_at(index))
            .collect();
        self.mark(&held)?;

        let mut contributors = Vec::new();
        for slot in &self.slots {
            let Some(object) = &slot.object else { continue };
            if !object.marked && object.refcount > 0 {
                let mut owned = Vec::new();
                object.data.owned_children(&mut owned);
                contributors.push(owned);
            }
        }
        let broken = contributors.len();
        for owned in contributors {
            for child in owned {
                let object = self.get_mut(child)?;
                if object.marked {
                    self.dec_ref(Value::Ref(child))?;
                } else {
                    object.refcount -= 1;
                }
            }
        }
        Ok(broken)
    }

    /// Free every unmarked cell whose count is zero or less and clear the
    /// marks on the survivors.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(object) = slot.object.as_mut() else { continue };
            if object.marked || object.refcount > 0 {
                object.marked = false;
                continue;
            }
            slot.object = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
            freed += 1;
        }
        self.live -= freed;
        freed
    }

    /// Run a full cycle: mark from `roots`, break unreachable cycles, sweep,
    /// then double the threshold.
    pub fn collect(&mut self, roots: &[HeapId]) -> Result<GcReport, InternalError> {
        self.mark(roots)?;
        let cycles_broken = self.break_cycles()?;
        let freed = self.sweep();
        self.threshold = self.threshold.saturating_mul(2);
        self.collections += 1;

        tracing::debug!(
            target: "marrow::gc",
            collection = self.collections,
            freed,
            live = self.live,
            cycles_broken,
            next_threshold = self.threshold,
            "collected"
        );

        Ok(GcReport {
            freed,
            live: self.live,
            cycles_broken,
            next_threshold: self.threshold,
        })
    }
}
