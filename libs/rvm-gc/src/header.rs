use bitflags::bitflags;

/// Bookkeeping bytes charged to every object on top of its own size.
pub const OBJECT_HEADER: usize = 16;

bitflags! {
	#[derive(Copy, Clone, Debug, Eq, PartialEq)]
	pub struct ObjectFlags: u8 {
		const MARK = 1;
	}
}

pub(crate) struct GcSlot<T> {
	pub(crate) generation: u32,
	pub(crate) flags: ObjectFlags,
	/// Total size charged for the object, header included.
	pub(crate) size: usize,
	pub(crate) object: Option<T>,
}

impl<T> GcSlot<T> {
	pub(crate) fn is_marked(&self, mark: bool) -> bool {
		self.flags.contains(ObjectFlags::MARK) == mark
	}
}
