use std::any::Any;

use log::debug;

use crate::{
    diagnostics::Diagnostic,
    value::{ObjectRef, TemplateId},
};

struct Slot {
    template: TemplateId,
    value: Box<dyn Any>,
}

#[derive(Default)]
struct Entry {
    /// Bumped on every release, so handles to earlier occupants stop matching.
    generation: u32,
    pins: u32,
    live: Option<Slot>,
}

/// Arena of host objects owned by a single thread. Handles are slot indices
/// paired with the slot's generation; released slots are recycled.
#[derive(Default)]
pub struct Heap {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, template: TemplateId, value: Box<dyn Any>) -> ObjectRef {
        let slot = Slot { template, value };
        let handle = match self.free.pop() {
            Some(handle) => handle,
            None => {
                self.entries.push(Entry::default());
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[handle as usize];
        entry.live = Some(slot);
        self.live += 1;
        ObjectRef {
            handle,
            generation: entry.generation,
            template,
        }
    }

    /// Drops the object behind `object`, returning its value to the host.
    pub fn release(&mut self, object: ObjectRef) -> Option<Box<dyn Any>> {
        let entry = self.entry_mut(object)?;
        let released = entry.live.take().map(|live| live.value);
        entry.generation = entry.generation.wrapping_add(1);
        entry.pins = 0;
        self.free.push(object.handle);
        self.live -= 1;
        released
    }

    pub fn get_any(&self, object: ObjectRef) -> Result<&dyn Any, Diagnostic> {
        match self.entry(object).and_then(|entry| entry.live.as_ref()) {
            Some(slot) => Ok(&*slot.value),
            None => Err(dangling(object)),
        }
    }

    pub fn get<T: Any>(&self, object: ObjectRef) -> Result<&T, Diagnostic> {
        self.get_any(object)?
            .downcast_ref::<T>()
            .ok_or_else(|| mismatched::<T>(object))
    }

    pub fn get_mut<T: Any>(&mut self, object: ObjectRef) -> Result<&mut T, Diagnostic> {
        match self.entry_mut(object).and_then(|entry| entry.live.as_mut()) {
            Some(slot) => slot
                .value
                .downcast_mut::<T>()
                .ok_or_else(|| mismatched::<T>(object)),
            None => Err(dangling(object)),
        }
    }

    pub fn contains(&self, object: ObjectRef) -> bool {
        self.entry(object).is_some()
    }

    /// Keeps `object` alive across collections until a matching [`Heap::unpin`].
    pub fn pin(&mut self, object: ObjectRef) -> bool {
        match self.entry_mut(object) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, object: ObjectRef) -> bool {
        match self.entry_mut(object) {
            Some(entry) if entry.pins > 0 => {
                entry.pins -= 1;
                true
            }
            _ => false,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Releases every object not reachable from `roots` or a pin. `trace`
    /// reports the references an object holds to other objects. Returns the
    /// number of objects released.
    pub fn collect<F>(&mut self, roots: impl IntoIterator<Item = ObjectRef>, mut trace: F) -> usize
    where
        F: FnMut(TemplateId, &dyn Any, &mut Vec<ObjectRef>),
    {
        let mut marked = vec![false; self.entries.len()];
        let mut pending: Vec<ObjectRef> = roots.into_iter().collect();
        pending.extend(self.entries.iter().enumerate().filter_map(|(handle, entry)| {
            let slot = entry.live.as_ref().filter(|_| entry.pins > 0)?;
            Some(ObjectRef {
                handle: handle as u32,
                generation: entry.generation,
                template: slot.template,
            })
        }));

        while let Some(object) = pending.pop() {
            let Some(slot) = self.entry(object).and_then(|entry| entry.live.as_ref()) else {
                continue;
            };
            let seen = &mut marked[object.handle as usize];
            if *seen {
                continue;
            }
            *seen = true;
            trace(slot.template, &*slot.value, &mut pending);
        }

        let mut released = 0;
        for (handle, entry) in self.entries.iter_mut().enumerate() {
            if entry.live.is_some() && !marked[handle] {
                entry.live = None;
                entry.generation = entry.generation.wrapping_add(1);
                entry.pins = 0;
                self.free.push(handle as u32);
                released += 1;
            }
        }
        self.live -= released;
        debug!("heap collection released {released} objects, {} live", self.live);
        released
    }

    fn entry(&self, object: ObjectRef) -> Option<&Entry> {
        self.entries
            .get(object.handle as usize)
            .filter(|entry| matches_object(entry, object))
    }

    fn entry_mut(&mut self, object: ObjectRef) -> Option<&mut Entry> {
        self.entries
            .get_mut(object.handle as usize)
            .filter(|entry| matches_object(entry, object))
    }
}

fn matches_object(entry: &Entry, object: ObjectRef) -> bool {
    entry.generation == object.generation
        && entry
            .live
            .as_ref()
            .is_some_and(|slot| slot.template == object.template)
}

fn dangling(object: ObjectRef) -> Diagnostic {
    Diagnostic::runtime(format!("object #{} is not alive in this thread", object.handle))
}

fn mismatched<T>(object: ObjectRef) -> Diagnostic {
    Diagnostic::runtime(format!(
        "object #{} does not hold a `{}`",
        object.handle,
        std::any::type_name::<T>()
    ))
}
