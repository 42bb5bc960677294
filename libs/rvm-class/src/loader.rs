use crate::source::ClassSource;
use eyre::Context;
use rvm_core::{Id, ObjectType, StorageValue};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};

pub type LoaderId = Id<LoaderData>;

/// A class loader: a name, the places it loads classes from, and its unloading state.
///
/// Loaders are owned by the registry. A loader is marked unloading once the collector found its
/// holder unreachable and it no longer defines any class; from then on it refuses new classes.
pub struct LoaderData {
	id: LoaderId,
	name: String,
	permanent: bool,
	unloading: AtomicBool,
	sources: Vec<Box<dyn ClassSource>>,
}

impl LoaderData {
	pub(crate) fn new(
		id: LoaderId,
		name: String,
		permanent: bool,
		sources: Vec<Box<dyn ClassSource>>,
	) -> LoaderData {
		LoaderData {
			id,
			name,
			permanent,
			unloading: AtomicBool::new(false),
			sources,
		}
	}

	pub fn id(&self) -> LoaderId {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// The boot loader is permanent. Its classes are never unloaded.
	pub fn is_permanent(&self) -> bool {
		self.permanent
	}

	pub fn is_unloading(&self) -> bool {
		self.unloading.load(Ordering::Acquire)
	}

	pub(crate) fn mark_unloading(&self) {
		self.unloading.store(true, Ordering::Release);
	}

	pub(crate) fn find_class(&self, ty: &ObjectType) -> eyre::Result<Option<Vec<u8>>> {
		for source in &self.sources {
			if let Some(data) = source
				.try_load(ty)
				.wrap_err_with(|| format!("Failed to load {} from source", ty.name))?
			{
				return Ok(Some(data));
			}
		}

		Ok(None)
	}
}

impl Debug for LoaderData {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LoaderData")
			.field("id", &self.id)
			.field("name", &self.name)
			.field("permanent", &self.permanent)
			.field("unloading", &self.is_unloading())
			.finish()
	}
}

impl StorageValue for LoaderData {
	type Idx = u32;
	const NAME: &'static str = "Loader";
}
