use crate::{GcRef, GcUser};
use std::cell::RefCell;

/// Collects the references a [`crate::RootProvider`] hands out during marking.
///
/// Marking does not recurse through the marker, the collector drains it with a worklist so deep
/// object chains cannot overflow the stack.
pub struct GcMarker<U: GcUser> {
	pending: RefCell<Vec<GcRef<U>>>,
}

impl<U: GcUser> GcMarker<U> {
	pub(crate) fn new() -> GcMarker<U> {
		GcMarker {
			pending: RefCell::new(vec![]),
		}
	}

	pub fn mark(&self, reference: GcRef<U>) {
		self.pending.borrow_mut().push(reference);
	}

	pub(crate) fn into_pending(self) -> Vec<GcRef<U>> {
		self.pending.into_inner()
	}
}
