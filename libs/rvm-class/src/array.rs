use crate::{ClassDefinition, ClassDescriptor, ClassError, ClassRegistry};
use rvm_core::MAX_ARRAY_DIMENSIONS;
use std::sync::Arc;
use tracing::trace;

impl ClassRegistry {
	/// Returns the canonical array class of `dimensions` over `component`, defining it (and every
	/// intermediate array class) if needed.
	///
	/// The array class is defined by the component's loader. It only refers to its component by id,
	/// so deriving it never keeps the component registered.
	pub fn derive_array_class(
		&self,
		component: &ClassDescriptor,
		dimensions: u32,
	) -> Result<Arc<ClassDescriptor>, ClassError> {
		let max = MAX_ARRAY_DIMENSIONS - component.dimensions();
		if dimensions == 0 || dimensions > u32::from(max) {
			return Err(ClassError::InvalidDimensions { dimensions, max });
		}

		let mut current = self
			.get(component.id())
			.ok_or_else(|| ClassError::ComponentNotLoaded {
				name: component.name().to_string(),
			})?;

		for _ in 0..dimensions {
			current = self.derive_one(&current)?;
		}
		Ok(current)
	}

	fn derive_one(&self, component: &ClassDescriptor) -> Result<Arc<ClassDescriptor>, ClassError> {
		let definition = ClassDefinition::array(component);
		let name = definition.ty.name();

		if let Some(existing) = self.lookup_in(component.loader(), &name) {
			if existing.kind() == &definition.kind {
				trace!("Reusing array class {name} at {:?}", existing.id());
				return Ok(existing);
			}
		}

		Ok(self.insert(definition)?.into_descriptor())
	}
}
