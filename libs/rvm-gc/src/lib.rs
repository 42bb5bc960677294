mod collector;
mod header;
mod marker;
mod reference;

pub use collector::*;
pub use header::*;
pub use marker::*;
pub use reference::*;

pub trait GcUser: Sized + 'static {
	type Object: Send;

	// Go through all the references which this object contains.
	fn visit_refs(object: &Self::Object, visitor: impl FnMut(GcRef<Self>));

	/// Bytes the object occupies, excluding the heap header.
	fn size(object: &Self::Object) -> usize;
}

pub trait RootProvider<U: GcUser> {
	fn mark_roots(&self, marker: &GcMarker<U>);
}

pub struct VecRootProvider<U: GcUser> {
	references: Vec<Option<GcRef<U>>>,
	free: Vec<usize>,
}

impl<U: GcUser> VecRootProvider<U> {
	pub fn new() -> VecRootProvider<U> {
		VecRootProvider {
			references: vec![],
			free: vec![],
		}
	}

	/// Roots a reference. The returned index stays valid until it is removed, after which it may be
	/// handed out again.
	pub fn add(&mut self, reference: GcRef<U>) -> usize {
		if let Some(index) = self.free.pop() {
			self.references[index] = Some(reference);
			return index;
		}
		self.references.push(Some(reference));
		self.references.len() - 1
	}

	pub fn remove(&mut self, index: usize) -> Option<GcRef<U>> {
		let reference = self.references.get_mut(index)?.take()?;
		self.free.push(index);
		Some(reference)
	}

	pub fn get(&self, index: usize) -> Option<GcRef<U>> {
		self.references.get(index).copied().flatten()
	}

	pub fn len(&self) -> usize {
		self.references.iter().flatten().count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<U: GcUser> Default for VecRootProvider<U> {
	fn default() -> Self {
		VecRootProvider::new()
	}
}

impl<U: GcUser> RootProvider<U> for VecRootProvider<U> {
	fn mark_roots(&self, marker: &GcMarker<U>) {
		for reference in self.references.iter().flatten() {
			marker.mark(*reference);
		}
	}
}
