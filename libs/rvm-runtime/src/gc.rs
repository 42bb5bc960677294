use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use rvm_class::{ClassId, LoaderId};
use rvm_gc::{GcMarker, GcUser, RootProvider, VecRootProvider};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub use rvm_gc::{AllocationError, GCStatistics};

pub type GcRef = rvm_gc::GcRef<JavaUser>;

pub struct JavaUser;

const REFERENCE: usize = 8;

impl JavaUser {
	/// Heap size of an array with `length` elements, saturating for lengths no heap can hold.
	pub fn array_size(length: usize) -> usize {
		length
			.saturating_add(1)
			.saturating_mul(REFERENCE)
			.saturating_add(8)
	}
}

impl GcUser for JavaUser {
	type Object = JavaObject;

	fn visit_refs(object: &JavaObject, mut visitor: impl FnMut(GcRef)) {
		match object {
			JavaObject::Instance { mirror, fields, .. } => {
				visitor(*mirror);
				fields.iter().flatten().for_each(|field| visitor(*field));
			}
			JavaObject::Array {
				mirror, elements, ..
			} => {
				visitor(*mirror);
				elements.iter().flatten().for_each(|element| visitor(*element));
			}
			JavaObject::Mirror {
				loader, component, ..
			} => {
				loader.iter().chain(component).for_each(|value| visitor(*value));
			}
			JavaObject::Loader { classes, .. } => {
				classes.iter().for_each(|mirror| visitor(*mirror));
			}
		}
	}

	fn size(object: &JavaObject) -> usize {
		match object {
			JavaObject::Instance { fields, .. } => REFERENCE * (fields.len() + 1),
			JavaObject::Array { elements, .. } => JavaUser::array_size(elements.len()),
			JavaObject::Mirror { .. } => 8 + REFERENCE * 2,
			JavaObject::Loader { .. } => 32,
		}
	}
}

/// Objects on the Java heap.
///
/// Every instance and array points at the mirror of its class. Mirrors point at the holder object
/// of their defining loader and, for array classes, at the mirror of their component. Loader
/// objects point at the mirrors of every class they define. Marking the heap therefore also marks
/// the class metadata the reachable objects depend on.
#[derive(Clone)]
pub enum JavaObject {
	Instance {
		class: ClassId,
		mirror: GcRef,
		fields: Vec<Option<GcRef>>,
	},
	Array {
		class: ClassId,
		mirror: GcRef,
		elements: Vec<Option<GcRef>>,
	},
	/// The `java.lang.Class` object of a class.
	Mirror {
		class: ClassId,
		loader: Option<GcRef>,
		component: Option<GcRef>,
	},
	/// The `java.lang.ClassLoader` object holding a loader alive.
	Loader {
		loader: LoaderId,
		classes: Vec<GcRef>,
	},
}

impl JavaObject {
	pub fn kind(&self) -> ReferenceKind {
		match self {
			JavaObject::Instance { .. } => ReferenceKind::Instance,
			JavaObject::Array { .. } => ReferenceKind::Array,
			JavaObject::Mirror { .. } => ReferenceKind::Mirror,
			JavaObject::Loader { .. } => ReferenceKind::Loader,
		}
	}

	/// The class this object is an instance or array of.
	pub fn class(&self) -> Option<ClassId> {
		match self {
			JavaObject::Instance { class, .. } | JavaObject::Array { class, .. } => Some(*class),
			_ => None,
		}
	}
}

impl Debug for JavaObject {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			JavaObject::Instance { class, fields, .. } => {
				write!(f, "Instance({class:?}, {} fields)", fields.len())
			}
			JavaObject::Array {
				class, elements, ..
			} => write!(f, "Array({class:?}, length {})", elements.len()),
			JavaObject::Mirror { class, .. } => write!(f, "Mirror({class:?})"),
			JavaObject::Loader { loader, classes } => {
				write!(f, "Loader({loader:?}, {} classes)", classes.len())
			}
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
	Instance,
	Array,
	Mirror,
	Loader,
}

/// The object heap together with the metadata objects the runtime keeps for classes and loaders.
pub struct JavaHeap {
	pub(crate) gc: rvm_gc::GarbageCollector<JavaUser>,
	pub(crate) roots: Arc<RootSet>,
	/// Held shared while a mutator allocates and roots an object, exclusively while marking.
	pub(crate) safepoint: RwLock<()>,
	pub(crate) mirrors: RwLock<AHashMap<ClassId, GcRef>>,
	pub(crate) loader_objects: RwLock<AHashMap<LoaderId, GcRef>>,
	pub(crate) last_collection: Mutex<GCStatistics>,
}

impl JavaHeap {
	pub fn new(size: usize) -> JavaHeap {
		JavaHeap {
			gc: rvm_gc::GarbageCollector::new(size),
			roots: Arc::new(RootSet::default()),
			safepoint: RwLock::new(()),
			mirrors: RwLock::new(AHashMap::new()),
			loader_objects: RwLock::new(AHashMap::new()),
			last_collection: Mutex::new(GCStatistics::default()),
		}
	}

	pub fn mirror(&self, class: ClassId) -> Option<GcRef> {
		self.mirrors.read().get(&class).copied()
	}

	pub fn loader_object(&self, loader: LoaderId) -> Option<GcRef> {
		self.loader_objects.read().get(&loader).copied()
	}

	pub fn with<R>(&self, reference: GcRef, func: impl FnOnce(&JavaObject) -> R) -> Option<R> {
		self.gc.with(reference, func)
	}

	pub fn contains(&self, reference: GcRef) -> bool {
		self.gc.contains(reference)
	}

	pub fn used(&self) -> usize {
		self.gc.used()
	}

	pub fn objects(&self) -> usize {
		self.gc.objects()
	}

	/// Statistics of the last sweep.
	pub fn last_collection(&self) -> GCStatistics {
		*self.last_collection.lock()
	}

	pub fn root(&self, reference: GcRef) -> Root {
		RootSet::root(&self.roots, reference)
	}
}

/// Roots for a heap mark: the rooted handles, and with class unloading disabled every mirror and
/// loader object as well.
pub(crate) struct HeapRoots<'a> {
	pub(crate) heap: &'a JavaHeap,
	pub(crate) strong_metadata: bool,
}

impl RootProvider<JavaUser> for HeapRoots<'_> {
	fn mark_roots(&self, marker: &GcMarker<JavaUser>) {
		self.heap.roots.mark_roots(marker);
		if self.strong_metadata {
			for mirror in self.heap.mirrors.read().values() {
				marker.mark(*mirror);
			}
			for loader in self.heap.loader_objects.read().values() {
				marker.mark(*loader);
			}
		}
	}
}

#[derive(Default)]
pub struct RootSet {
	roots: Mutex<VecRootProvider<JavaUser>>,
}

impl RootSet {
	pub fn root(this: &Arc<RootSet>, reference: GcRef) -> Root {
		let index = this.roots.lock().add(reference);
		Root {
			roots: this.clone(),
			index,
			reference,
		}
	}

	pub fn len(&self) -> usize {
		self.roots.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.roots.lock().is_empty()
	}
}

impl RootProvider<JavaUser> for RootSet {
	fn mark_roots(&self, marker: &GcMarker<JavaUser>) {
		self.roots.lock().mark_roots(marker);
	}
}

/// Keeps an object reachable until dropped.
pub struct Root {
	roots: Arc<RootSet>,
	index: usize,
	reference: GcRef,
}

impl Root {
	pub fn reference(&self) -> GcRef {
		self.reference
	}
}

impl Clone for Root {
	fn clone(&self) -> Self {
		RootSet::root(&self.roots, self.reference)
	}
}

impl Drop for Root {
	fn drop(&mut self) {
		self.roots.roots.lock().remove(self.index);
	}
}

impl Debug for Root {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "Root({:?})", self.reference)
	}
}
