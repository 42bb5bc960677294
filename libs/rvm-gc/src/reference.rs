use crate::GcUser;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Handle to an object on the garbage collected heap.
///
/// A reference names a heap slot and the generation of that slot. Once the object is swept the
/// slot generation moves on, and every old reference to it stops resolving instead of aliasing
/// whatever gets allocated there next.
pub struct GcRef<U: GcUser> {
	index: u32,
	generation: u32,
	_u: PhantomData<fn() -> U>,
}

impl<U: GcUser> GcRef<U> {
	pub(crate) fn new(index: u32, generation: u32) -> GcRef<U> {
		GcRef {
			index,
			generation,
			_u: PhantomData,
		}
	}

	pub(crate) fn index(&self) -> usize {
		self.index as usize
	}

	pub(crate) fn generation(&self) -> u32 {
		self.generation
	}
}

impl<U: GcUser> Clone for GcRef<U> {
	fn clone(&self) -> Self {
		*self
	}
}

impl<U: GcUser> Copy for GcRef<U> {}

impl<U: GcUser> PartialEq for GcRef<U> {
	fn eq(&self, other: &Self) -> bool {
		self.index == other.index && self.generation == other.generation
	}
}

impl<U: GcUser> Eq for GcRef<U> {}

impl<U: GcUser> Hash for GcRef<U> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.index.hash(state);
		self.generation.hash(state);
	}
}

impl<U: GcUser> Debug for GcRef<U> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "GcRef({}v{})", self.index, self.generation)
	}
}
