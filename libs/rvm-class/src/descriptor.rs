use crate::LoaderId;
use rvm_core::{Id, StorageValue, Type};
use std::fmt::{Debug, Formatter};

pub type ClassId = Id<ClassDescriptor>;

/// Immutable metadata of a loaded class or array class.
///
/// Descriptors are published as `Arc<ClassDescriptor>` and never change afterwards. Holding one does
/// not keep it in the registry; after a collection it must be looked up again by name.
pub struct ClassDescriptor {
	id: ClassId,
	ty: Type,
	name: String,
	loader: LoaderId,
	kind: ClassKind,
	size: usize,
}

impl ClassDescriptor {
	pub(crate) fn new(id: ClassId, definition: ClassDefinition) -> ClassDescriptor {
		ClassDescriptor {
			id,
			name: definition.ty.name(),
			ty: definition.ty,
			loader: definition.loader,
			kind: definition.kind,
			size: definition.size,
		}
	}

	pub fn id(&self) -> ClassId {
		self.id
	}

	pub fn ty(&self) -> &Type {
		&self.ty
	}

	/// Binary name, `test.Empty` or `[Ltest.Empty;`.
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn loader(&self) -> LoaderId {
		self.loader
	}

	pub fn kind(&self) -> &ClassKind {
		&self.kind
	}

	/// Bytes of class data this descriptor was defined from. Zero for array classes.
	pub fn size(&self) -> usize {
		self.size
	}

	pub fn array(&self) -> Option<&ArrayClass> {
		if let ClassKind::Array(array) = &self.kind {
			return Some(array);
		}
		None
	}

	pub fn is_array(&self) -> bool {
		self.array().is_some()
	}

	pub fn dimensions(&self) -> u8 {
		self.array().map_or(0, |array| array.dimensions)
	}
}

impl Debug for ClassDescriptor {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClassDescriptor")
			.field("id", &self.id)
			.field("name", &self.name)
			.field("loader", &self.loader)
			.field("kind", &self.kind)
			.finish()
	}
}

impl StorageValue for ClassDescriptor {
	type Idx = u32;
	const NAME: &'static str = "Class";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClassKind {
	Ordinary,
	Array(ArrayClass),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayClass {
	pub(crate) component: ComponentRef,
	pub(crate) dimensions: u8,
}

impl ArrayClass {
	/// The immediate component, `[Ltest.Empty;` for `[[Ltest.Empty;`.
	pub fn component(&self) -> &ComponentRef {
		&self.component
	}

	pub fn dimensions(&self) -> u8 {
		self.dimensions
	}
}

/// Lookup-only reference from an array class to its component.
///
/// It carries the component's registry id and name and nothing that would keep the component
/// registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentRef {
	pub(crate) id: ClassId,
	pub(crate) name: String,
}

impl ComponentRef {
	pub fn id(&self) -> ClassId {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}
}

/// Everything the registry needs to create a descriptor, minus its id.
#[derive(Clone, Debug)]
pub struct ClassDefinition {
	pub ty: Type,
	pub loader: LoaderId,
	pub kind: ClassKind,
	pub size: usize,
}

impl ClassDefinition {
	pub fn ordinary(ty: Type, loader: LoaderId, size: usize) -> ClassDefinition {
		ClassDefinition {
			ty,
			loader,
			kind: ClassKind::Ordinary,
			size,
		}
	}

	pub(crate) fn array(component: &ClassDescriptor) -> ClassDefinition {
		ClassDefinition {
			ty: component.ty.clone().array_of(1),
			loader: component.loader,
			kind: ClassKind::Array(ArrayClass {
				component: ComponentRef {
					id: component.id,
					name: component.name.clone(),
				},
				dimensions: component.dimensions() + 1,
			}),
			size: 0,
		}
	}
}
