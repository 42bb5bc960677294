use ahash::AHashSet;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::header::GcSlot;
use crate::{GcMarker, GcRef, GcUser, ObjectFlags, RootProvider, OBJECT_HEADER};

/// A non-moving mark and sweep heap with a fixed capacity.
///
/// Closures passed to [`GarbageCollector::with`] and friends run under the heap lock and must not
/// call back into the collector.
pub struct GarbageCollector<U: GcUser> {
	inner: Mutex<InnerGarbageCollector<U>>,
}

impl<U: GcUser> GarbageCollector<U> {
	pub fn new(size: usize) -> Self {
		Self {
			inner: Mutex::new(InnerGarbageCollector {
				slots: vec![],
				free_slots: vec![],
				frozen: AHashSet::new(),
				mark: false,
				unswept: false,
				size,
				used: 0,
				objects: 0,
			}),
		}
	}

	pub fn alloc(&self, object: U::Object) -> Result<GcRef<U>, AllocationError> {
		self.inner.lock().allocate(object)
	}

	/// Fails with [`AllocationError::ObjectTooBig`] when an object of `size` bytes can never fit,
	/// so callers can reject it before building the object.
	pub fn ensure_fits(&self, size: usize) -> Result<(), AllocationError> {
		match size.checked_add(OBJECT_HEADER) {
			Some(total) if total <= self.size() => Ok(()),
			_ => Err(AllocationError::ObjectTooBig),
		}
	}

	pub fn contains(&self, reference: GcRef<U>) -> bool {
		self.inner.lock().slot(reference).is_some()
	}

	pub fn with<R>(&self, reference: GcRef<U>, func: impl FnOnce(&U::Object) -> R) -> Option<R> {
		let guard = self.inner.lock();
		let object = guard.slot(reference)?.object.as_ref()?;
		Some(func(object))
	}

	pub fn with_mut<R>(
		&self,
		reference: GcRef<U>,
		func: impl FnOnce(&mut U::Object) -> R,
	) -> Option<R> {
		let mut guard = self.inner.lock();
		let object = guard.slot_mut(reference)?.object.as_mut()?;
		Some(func(object))
	}

	pub fn add_frozen(&self, reference: GcRef<U>) {
		self.inner.lock().add_frozen(reference)
	}

	pub fn remove_frozen(&self, reference: GcRef<U>) {
		self.inner.lock().remove_frozen(reference)
	}

	/// Marks everything reachable from the roots and the frozen set. Returns how many objects were
	/// reached.
	///
	/// Objects allocated after marking count as alive until the next mark.
	pub fn mark(&self, roots: &impl RootProvider<U>) -> usize {
		self.inner.lock().mark(roots)
	}

	/// Whether the object survived the last mark.
	pub fn is_marked(&self, reference: GcRef<U>) -> bool {
		let guard = self.inner.lock();
		let mark = guard.mark;
		guard.slot(reference).is_some_and(|slot| slot.is_marked(mark))
	}

	/// Visits every object that survived the last mark.
	pub fn walk_alive(&self, visitor: impl FnMut(GcRef<U>, &U::Object)) {
		self.inner.lock().walk_alive(visitor)
	}

	/// Frees every object the last mark did not reach. Without a preceding mark nothing is freed.
	pub fn sweep(&self) -> GCStatistics {
		self.inner.lock().sweep()
	}

	pub fn gc(&self, roots: &impl RootProvider<U>) -> GCStatistics {
		let mut guard = self.inner.lock();
		guard.mark(roots);
		guard.sweep()
	}

	pub fn used(&self) -> usize {
		self.inner.lock().used
	}

	pub fn size(&self) -> usize {
		self.inner.lock().size
	}

	pub fn objects(&self) -> usize {
		self.inner.lock().objects
	}
}

pub struct InnerGarbageCollector<U: GcUser> {
	slots: Vec<GcSlot<U::Object>>,
	free_slots: Vec<u32>,
	frozen: AHashSet<GcRef<U>>,
	/// Objects whose mark flag equals this are alive.
	mark: bool,
	/// A mark ran and its sweep did not yet.
	unswept: bool,
	size: usize,
	used: usize,
	objects: usize,
}

impl<U: GcUser> InnerGarbageCollector<U> {
	fn slot(&self, reference: GcRef<U>) -> Option<&GcSlot<U::Object>> {
		self.slots
			.get(reference.index())
			.filter(|slot| slot.generation == reference.generation() && slot.object.is_some())
	}

	fn slot_mut(&mut self, reference: GcRef<U>) -> Option<&mut GcSlot<U::Object>> {
		self.slots
			.get_mut(reference.index())
			.filter(|slot| slot.generation == reference.generation() && slot.object.is_some())
	}

	pub fn add_frozen(&mut self, reference: GcRef<U>) {
		if !self.frozen.insert(reference) {
			panic!("Double insertion!");
		}
	}

	pub fn remove_frozen(&mut self, reference: GcRef<U>) {
		if !self.frozen.remove(&reference) {
			panic!("Removed a reference which was not frozen. (did you double free?)")
		}
	}

	pub fn allocate(&mut self, object: U::Object) -> Result<GcRef<U>, AllocationError> {
		let total_size = U::size(&object) + OBJECT_HEADER;
		if total_size > self.size {
			return Err(AllocationError::ObjectTooBig);
		}
		if self.used + total_size > self.size {
			return Err(AllocationError::OutOfHeap);
		}

		let flags = if self.mark {
			ObjectFlags::MARK
		} else {
			ObjectFlags::empty()
		};

		let reference = match self.free_slots.pop() {
			Some(index) => {
				let slot = &mut self.slots[index as usize];
				slot.flags = flags;
				slot.size = total_size;
				slot.object = Some(object);
				GcRef::new(index, slot.generation)
			}
			None => {
				let index = u32::try_from(self.slots.len()).map_err(|_| AllocationError::OutOfHeap)?;
				self.slots.push(GcSlot {
					generation: 0,
					flags,
					size: total_size,
					object: Some(object),
				});
				GcRef::new(index, 0)
			}
		};

		self.used += total_size;
		self.objects += 1;
		trace!(
			target: "gc",
			"Allocated {reference:?} of {total_size} bytes, {}/{}",
			self.used,
			self.size
		);
		Ok(reference)
	}

	pub(super) fn mark(&mut self, roots: &impl RootProvider<U>) -> usize {
		let mark = !self.mark;
		if self.unswept {
			// Flags left over from a mark that was never swept.
			for slot in &mut self.slots {
				slot.flags.set(ObjectFlags::MARK, !mark);
			}
		}
		self.mark = mark;
		self.unswept = true;

		debug!(target: "gc", "Marking roots");
		let marker = GcMarker::new();
		roots.mark_roots(&marker);
		for reference in &self.frozen {
			marker.mark(*reference);
		}

		let mut pending = marker.into_pending();
		let mut visited = 0;
		while let Some(reference) = pending.pop() {
			let Some(slot) = self.slot_mut(reference) else {
				continue;
			};
			if slot.is_marked(mark) {
				// We have already visited this object.
				continue;
			}

			trace!(target: "gc", "Visiting {reference:?}");
			slot.flags.set(ObjectFlags::MARK, mark);
			visited += 1;
			if let Some(object) = &slot.object {
				U::visit_refs(object, |child| pending.push(child));
			}
		}

		debug!(target: "gc", "Marked {visited}/{} objects", self.objects);
		visited
	}

	pub(super) fn sweep(&mut self) -> GCStatistics {
		if !self.unswept {
			return GCStatistics {
				objects_cleared: 0,
				objects_remaining: self.objects,
				bytes_freed: 0,
			};
		}

		debug!(target: "gc", "Dropping data");
		let mark = self.mark;
		let mut objects_cleared = 0;
		let mut bytes_freed = 0;
		for (index, slot) in self.slots.iter_mut().enumerate() {
			if slot.object.is_none() || slot.is_marked(mark) {
				continue;
			}

			slot.object = None;
			slot.generation = slot.generation.wrapping_add(1);
			objects_cleared += 1;
			bytes_freed += slot.size;
			self.free_slots.push(index as u32);
		}

		self.used -= bytes_freed;
		self.objects -= objects_cleared;
		self.unswept = false;

		debug!(target: "gc", "Cleared {objects_cleared} objects, {bytes_freed} bytes");
		GCStatistics {
			objects_cleared,
			objects_remaining: self.objects,
			bytes_freed,
		}
	}

	pub fn walk(&self, mut visitor: impl FnMut(bool, GcRef<U>, &U::Object)) {
		for (index, slot) in self.slots.iter().enumerate() {
			if let Some(object) = &slot.object {
				let reference = GcRef::new(index as u32, slot.generation);
				visitor(slot.is_marked(self.mark), reference, object);
			}
		}
	}

	pub fn walk_alive(&self, mut visitor: impl FnMut(GcRef<U>, &U::Object)) {
		self.walk(|alive, reference, object| {
			if alive {
				visitor(reference, object);
			}
		});
	}
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GCStatistics {
	pub objects_cleared: usize,
	pub objects_remaining: usize,
	pub bytes_freed: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
	#[error("Out of heap space")]
	OutOfHeap,
	#[error("Object is too big to be allocated")]
	ObjectTooBig,
}
