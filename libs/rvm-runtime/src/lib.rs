use std::sync::Arc;

use crossbeam::channel::Receiver;
use eyre::{bail, Context};
use thiserror::Error;
use tracing::{debug, info};

use rvm_class::{ClassCounts, ClassDescriptor, ClassError, ClassRegistry, ClassSource, LoaderId};

pub use crate::config::RuntimeConfig;
pub use crate::gc::*;
use crate::unload::{CycleReport, HeapOracle, UnloadCoordinator, UnloadEvent};

mod config;
mod gc;
pub mod unload;

/// A runtime holding the class registry, the object heap, and the coordinator unloading classes
/// once nothing on the heap needs them anymore.
pub struct Runtime {
	pub cl: Arc<ClassRegistry>,
	pub heap: Arc<JavaHeap>,
	pub unloader: UnloadCoordinator<HeapOracle>,
	config: RuntimeConfig,
}

impl Runtime {
	pub fn new(config: RuntimeConfig, boot_sources: Vec<Box<dyn ClassSource>>) -> Runtime {
		let cl = Arc::new(ClassRegistry::new(boot_sources));
		let heap = Arc::new(JavaHeap::new(config.heap_size));
		let oracle = HeapOracle::new(heap.clone(), config.class_unloading);
		let unloader =
			UnloadCoordinator::new(cl.clone(), oracle).with_class_unloading(config.class_unloading);

		info!(
			"Created runtime with {} bytes of heap, class unloading {}",
			config.heap_size,
			if config.class_unloading { "enabled" } else { "disabled" }
		);
		Runtime {
			cl,
			heap,
			unloader,
			config,
		}
	}

	pub fn config(&self) -> &RuntimeConfig {
		&self.config
	}

	pub fn boot_loader(&self) -> LoaderId {
		self.cl.boot_loader()
	}

	/// Creates a class loader together with the heap object holding it alive.
	pub fn new_class_loader(
		&self,
		name: impl Into<String>,
		sources: Vec<Box<dyn ClassSource>>,
	) -> eyre::Result<JavaLoader> {
		let name = name.into();
		let id = self.cl.new_loader(name.clone(), sources);
		let object = self.allocate_rooted(|heap| {
			let object = heap.gc.alloc(JavaObject::Loader {
				loader: id,
				classes: vec![],
			})?;
			heap.loader_objects.write().insert(id, object);
			Ok(object)
		});

		match object {
			Ok(object) => Ok(JavaLoader { id, object }),
			Err(error) => {
				self.cl.unload_loaders(&[id]);
				Err(error.wrap_err(format!("Allocating the holder of class loader {name}")))
			}
		}
	}

	pub fn load_class(&self, loader: LoaderId, name: &str) -> eyre::Result<JavaClass> {
		let descriptor = self
			.cl
			.load_class(loader, name)
			.wrap_err_with(|| format!("Loading class {name}"))?;
		let mirror = self.mirror_of(&descriptor)?;
		Ok(JavaClass { descriptor, mirror })
	}

	/// Derives the array class of `dimensions` over `component`.
	pub fn derive_array_class(
		&self,
		component: &ClassDescriptor,
		dimensions: u32,
	) -> eyre::Result<JavaClass> {
		let max = self
			.config
			.max_array_dimensions
			.saturating_sub(component.dimensions());
		if dimensions > u32::from(max) {
			return Err(ClassError::InvalidDimensions { dimensions, max }.into());
		}

		let descriptor = self.cl.derive_array_class(component, dimensions)?;
		let mirror = self.mirror_of(&descriptor)?;
		Ok(JavaClass { descriptor, mirror })
	}

	/// `Array.newInstance(component, length)`: an array of nulls.
	pub fn new_array_instance(&self, component: &ClassDescriptor, length: u32) -> eyre::Result<Root> {
		let array = self.derive_array_class(component, 1)?;
		let length = length as usize;
		self.allocate_rooted(|heap| {
			heap.gc.ensure_fits(JavaUser::array_size(length))?;
			Ok(heap.gc.alloc(JavaObject::Array {
				class: array.descriptor.id(),
				mirror: array.mirror.reference(),
				elements: vec![None; length],
			})?)
		})
		.wrap_err_with(|| format!("Allocating {}[{length}]", array.descriptor.name()))
	}

	/// `Array.newInstance(component, lengths...)`: nested arrays, the innermost filled with nulls.
	pub fn new_multi_array(&self, component: &ClassDescriptor, lengths: &[u32]) -> eyre::Result<Root> {
		if lengths.is_empty() {
			return Err(ClassError::InvalidDimensions {
				dimensions: 0,
				max: self.config.max_array_dimensions,
			}
			.into());
		}

		let dimensions = lengths.len() as u32;
		// Outermost first.
		let classes = (1..=dimensions)
			.rev()
			.map(|dimensions| self.derive_array_class(component, dimensions))
			.collect::<eyre::Result<Vec<_>>>()?;

		self.allocate_rooted(|heap| Ok(Self::alloc_multi_array(heap, &classes, lengths)?))
			.wrap_err_with(|| format!("Allocating {} {lengths:?}", classes[0].descriptor.name()))
	}

	fn alloc_multi_array(
		heap: &JavaHeap,
		classes: &[JavaClass],
		lengths: &[u32],
	) -> Result<GcRef, AllocationError> {
		let length = lengths[0] as usize;
		heap.gc.ensure_fits(JavaUser::array_size(length))?;
		let elements = if lengths.len() == 1 {
			vec![None; length]
		} else {
			(0..length)
				.map(|_| Self::alloc_multi_array(heap, &classes[1..], &lengths[1..]).map(Some))
				.collect::<Result<Vec<_>, _>>()?
		};

		heap.gc.alloc(JavaObject::Array {
			class: classes[0].descriptor.id(),
			mirror: classes[0].mirror.reference(),
			elements,
		})
	}

	pub fn new_instance(&self, class: &ClassDescriptor) -> eyre::Result<Root> {
		if class.is_array() {
			bail!("{} is an array class", class.name());
		}

		let mirror = self.mirror_of(class)?;
		self.allocate_rooted(|heap| {
			Ok(heap.gc.alloc(JavaObject::Instance {
				class: class.id(),
				mirror: mirror.reference(),
				fields: vec![None],
			})?)
		})
		.wrap_err_with(|| format!("Allocating an instance of {}", class.name()))
	}

	/// Stores a reference into an array element or, for instances, into their single field.
	pub fn store(&self, target: &Root, index: usize, value: Option<&Root>) -> eyre::Result<()> {
		let value = value.map(|value| value.reference());
		let _safepoint = self.heap.safepoint.read();
		let stored = self
			.heap
			.gc
			.with_mut(target.reference(), |object| {
				let slots = match object {
					JavaObject::Instance { fields, .. } => fields,
					JavaObject::Array { elements, .. } => elements,
					_ => return false,
				};
				match slots.get_mut(index) {
					Some(slot) => {
						*slot = value;
						true
					}
					None => false,
				}
			})
			.unwrap_or(false);

		if !stored {
			bail!("Cannot store into {:?} at {index}", target.reference());
		}
		Ok(())
	}

	/// Reads a reference out of an array element or instance field, rooting it.
	pub fn load(&self, target: &Root, index: usize) -> Option<Root> {
		let _safepoint = self.heap.safepoint.read();
		let value = self.heap.gc.with(target.reference(), |object| match object {
			JavaObject::Instance { fields, .. } => fields.get(index).copied().flatten(),
			JavaObject::Array { elements, .. } => elements.get(index).copied().flatten(),
			_ => None,
		})??;
		Some(self.heap.root(value))
	}

	pub fn class_of(&self, object: &Root) -> Option<Arc<ClassDescriptor>> {
		let class = self.heap.with(object.reference(), |object| object.class())??;
		self.cl.get(class)
	}

	pub fn array_length(&self, array: &Root) -> Option<usize> {
		self.heap
			.with(array.reference(), |object| match object {
				JavaObject::Array { elements, .. } => Some(elements.len()),
				_ => None,
			})
			.flatten()
	}

	/// Whether a class of this name is currently loaded by any loader. Asking never keeps it loaded.
	pub fn is_class_alive(&self, name: &str) -> bool {
		self.cl.contains_name(name)
	}

	/// Collects the heap and unloads every class nothing reachable depends on anymore.
	pub fn trigger_full_collection(&self) -> eyre::Result<CycleReport> {
		let report = self
			.unloader
			.trigger()
			.wrap_err("Full collection failed")?;
		Ok(report)
	}

	pub fn subscribe_unload_events(&self) -> Receiver<UnloadEvent> {
		self.unloader.subscribe()
	}

	pub fn class_counts(&self) -> ClassCounts {
		self.cl.counts()
	}

	fn mirror_of(&self, class: &ClassDescriptor) -> eyre::Result<Root> {
		let mirror = self
			.allocate_rooted(|heap| self.ensure_mirror(heap, class))
			.wrap_err_with(|| format!("Allocating the mirror of {}", class.name()))?;

		// A running cycle may have evicted the class after the mirror was handed out.
		if !self.cl.contains(class.id()) {
			return Err(Self::unloaded(class).into());
		}
		Ok(mirror)
	}

	fn unloaded(class: &ClassDescriptor) -> ClassError {
		ClassError::ClassUnloaded {
			name: class.name().to_string(),
		}
	}

	/// Returns the mirror of a class, creating it and the mirrors of its components if needed.
	///
	/// Runs under the safepoint. A mirror the last mark did not reach belongs to a class the
	/// running cycle is unloading and is never handed out again.
	fn ensure_mirror(&self, heap: &JavaHeap, class: &ClassDescriptor) -> Result<GcRef, AllocateError> {
		if !self.cl.contains(class.id()) {
			return Err(Self::unloaded(class).into());
		}
		if let Some(mirror) = heap.mirror(class.id()).filter(|mirror| heap.contains(*mirror)) {
			if !heap.gc.is_marked(mirror) {
				return Err(Self::unloaded(class).into());
			}
			return Ok(mirror);
		}

		let component = match class.array().and_then(|array| self.cl.get(array.component().id())) {
			Some(component) => Some(self.ensure_mirror(heap, &component)?),
			None => None,
		};
		let loader = heap.loader_object(class.loader());

		let mut mirrors = heap.mirrors.write();
		if let Some(mirror) = mirrors.get(&class.id()).filter(|mirror| heap.contains(**mirror)) {
			if !heap.gc.is_marked(*mirror) {
				return Err(Self::unloaded(class).into());
			}
			return Ok(*mirror);
		}
		let mirror = heap.gc.alloc(JavaObject::Mirror {
			class: class.id(),
			loader,
			component,
		})?;
		mirrors.insert(class.id(), mirror);
		drop(mirrors);

		match loader {
			Some(loader) => {
				heap.gc.with_mut(loader, |object| {
					if let JavaObject::Loader { classes, .. } = object {
						classes.push(mirror);
					}
				});
			}
			// Classes of the boot loader are never unloaded.
			None if class.loader() == self.cl.boot_loader() => heap.gc.add_frozen(mirror),
			None => {}
		}

		debug!("Created mirror {mirror:?} for {}", class.name());
		Ok(mirror)
	}

	/// Allocates and roots an object without a collection in between, collecting once and trying
	/// again when the heap is full.
	fn allocate_rooted(
		&self,
		allocate: impl Fn(&JavaHeap) -> Result<GcRef, AllocateError>,
	) -> eyre::Result<Root> {
		let mut retried = false;
		loop {
			{
				let _safepoint = self.heap.safepoint.read();
				match allocate(&self.heap) {
					Ok(reference) => return Ok(self.heap.root(reference)),
					Err(AllocateError::Heap(AllocationError::OutOfHeap))
						if self.config.retry_allocation && !retried => {}
					Err(AllocateError::Heap(error)) => return Err(error.into()),
					Err(AllocateError::Class(error)) => return Err(error.into()),
				}
			}

			debug!("Heap is full, collecting before retrying the allocation");
			self.trigger_full_collection()?;
			retried = true;
		}
	}
}

impl Default for Runtime {
	fn default() -> Self {
		Runtime::new(RuntimeConfig::default(), vec![])
	}
}

/// Why an allocation under the safepoint failed.
#[derive(Error, Debug)]
enum AllocateError {
	#[error(transparent)]
	Heap(#[from] AllocationError),
	#[error(transparent)]
	Class(#[from] ClassError),
}

/// A class loader and the root keeping its holder object reachable.
#[derive(Clone, Debug)]
pub struct JavaLoader {
	pub id: LoaderId,
	pub object: Root,
}

/// A class and the root keeping its mirror reachable.
#[derive(Clone, Debug)]
pub struct JavaClass {
	pub descriptor: Arc<ClassDescriptor>,
	pub mirror: Root,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::unload::ReachabilityOracle;
	use rvm_class::MemoryClassSource;

	fn runtime(config: RuntimeConfig) -> Runtime {
		rvm_core::init();
		Runtime::new(config, vec![])
	}

	fn app_sources() -> Vec<Box<dyn ClassSource>> {
		vec![Box::new(
			MemoryClassSource::new().with("test.Empty", vec![0xCA, 0xFE, 0xBA, 0xBE]),
		)]
	}

	#[test]
	fn store_and_load() {
		let runtime = runtime(RuntimeConfig::default());
		let loader = runtime.new_class_loader("app", app_sources()).unwrap();
		let class = runtime.load_class(loader.id, "test.Empty").unwrap();
		let array = runtime.new_array_instance(&class.descriptor, 2).unwrap();
		let instance = runtime.new_instance(&class.descriptor).unwrap();

		runtime.store(&array, 1, Some(&instance)).unwrap();
		runtime.store(&instance, 0, Some(&array)).unwrap();
		let loaded = runtime.load(&array, 1).unwrap();
		assert_eq!(loaded.reference(), instance.reference());
		assert!(runtime.load(&array, 0).is_none());

		runtime.store(&array, 1, None).unwrap();
		assert!(runtime.load(&array, 1).is_none());
	}

	#[test]
	fn invalid_stores() {
		let runtime = runtime(RuntimeConfig::default());
		let loader = runtime.new_class_loader("app", app_sources()).unwrap();
		let class = runtime.load_class(loader.id, "test.Empty").unwrap();
		let array = runtime.new_array_instance(&class.descriptor, 2).unwrap();

		assert!(runtime.store(&array, 2, None).is_err());
		assert!(runtime.store(&class.mirror, 0, None).is_err());
		assert!(runtime.store(&loader.object, 0, Some(&array)).is_err());
	}

	#[test]
	fn instances_of_array_classes_are_rejected() {
		let runtime = runtime(RuntimeConfig::default());
		let loader = runtime.new_class_loader("app", app_sources()).unwrap();
		let class = runtime.load_class(loader.id, "test.Empty").unwrap();
		let array = runtime.derive_array_class(&class.descriptor, 1).unwrap();
		assert!(runtime.new_instance(&array.descriptor).is_err());
	}

	#[test]
	fn mirrors_follow_the_component() {
		let runtime = runtime(RuntimeConfig::default());
		let loader = runtime.new_class_loader("app", app_sources()).unwrap();
		let class = runtime.load_class(loader.id, "test.Empty").unwrap();
		let matrix = runtime.derive_array_class(&class.descriptor, 2).unwrap();

		let mirror = runtime.heap.with(matrix.mirror.reference(), JavaObject::clone).unwrap();
		let JavaObject::Mirror { loader, component, .. } = mirror else {
			panic!("Expected a mirror");
		};
		assert_eq!(loader, runtime.heap.loader_object(matrix.descriptor.loader()));
		let component = component.unwrap();
		let inner = runtime.cl.lookup("[Ltest.Empty;").unwrap();
		assert_eq!(Some(component), runtime.heap.mirror(inner.id()));
	}

	#[test]
	fn failed_holder_allocation_drops_the_loader() {
		let runtime = runtime(RuntimeConfig {
			heap_size: 32,
			..RuntimeConfig::default()
		});
		let error = runtime.new_class_loader("app", app_sources()).unwrap_err();
		assert_eq!(
			error.downcast_ref::<AllocationError>(),
			Some(&AllocationError::ObjectTooBig)
		);
		assert_eq!(runtime.cl.loaders().len(), 1);
		assert_eq!(runtime.unloader.cycles(), 0);
	}

	#[test]
	fn collection_keeps_rooted_loaders() {
		let runtime = runtime(RuntimeConfig::default());
		let loader = runtime.new_class_loader("app", app_sources()).unwrap();
		let unused = runtime.new_class_loader("unused", app_sources()).unwrap();
		let unused_id = unused.id;
		drop(unused);

		let report = runtime.trigger_full_collection().unwrap();
		assert_eq!(report.unloaded_loaders.len(), 1);
		assert_eq!(report.unloaded_loaders[0].id(), unused_id);
		assert!(runtime.cl.loader(loader.id).is_some());
		assert!(runtime.heap.loader_object(unused_id).is_none());
		assert_eq!(runtime.heap.objects(), 1);
	}

	#[test]
	fn unmarked_mirrors_are_not_reused() {
		let runtime = runtime(RuntimeConfig::default());
		let loader = runtime.new_class_loader("app", app_sources()).unwrap();
		let class = runtime.load_class(loader.id, "test.Empty").unwrap();
		let descriptor = class.descriptor.clone();
		let mirror = class.mirror.reference();
		drop((loader, class));

		// Marked but not yet swept, as while a cycle is deciding.
		let mut oracle = HeapOracle::new(runtime.heap.clone(), true);
		oracle.begin_cycle(&runtime.cl.snapshot()).unwrap();
		assert!(runtime.heap.contains(mirror));
		assert!(!runtime.heap.gc.is_marked(mirror));

		let error = runtime.new_instance(&descriptor).unwrap_err();
		assert_eq!(
			error.downcast_ref::<ClassError>(),
			Some(&ClassError::ClassUnloaded {
				name: "test.Empty".to_string()
			})
		);
		let error = runtime.derive_array_class(&descriptor, 1).unwrap_err();
		assert!(matches!(
			error.downcast_ref::<ClassError>(),
			Some(ClassError::ClassUnloaded { .. })
		));
		assert_eq!(runtime.heap.objects(), 2);
	}
}
