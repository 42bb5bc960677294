use crate::{
	ClassDefinition, ClassDescriptor, ClassError, ClassId, ClassKind, ClassSource, LoaderData,
	LoaderId,
};
use ahash::AHashMap;
use eyre::Context;
use parking_lot::RwLock;
use rvm_core::{Id, Storage, Type};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Hash, Eq, PartialEq, Debug)]
struct ClassKey {
	loader: LoaderId,
	name: String,
}

struct LoaderEntry {
	data: Arc<LoaderData>,
	classes: BTreeSet<ClassId>,
}

struct RegistryInner {
	classes: Storage<ClassKey, ClassDescriptor, Arc<ClassDescriptor>>,
	by_name: AHashMap<String, BTreeSet<ClassId>>,
	loaders: BTreeMap<LoaderId, LoaderEntry>,
	next_loader: usize,
	generation: u64,
}

impl RegistryInner {
	fn add_loader(
		&mut self,
		name: String,
		permanent: bool,
		sources: Vec<Box<dyn ClassSource>>,
	) -> LoaderId {
		self.next_loader += 1;
		let id = Id::new(self.next_loader);
		let data = Arc::new(LoaderData::new(id, name, permanent, sources));
		self.loaders.insert(
			id,
			LoaderEntry {
				data,
				classes: BTreeSet::new(),
			},
		);
		id
	}
}

/// Authoritative table of every loaded class and array class, and of the loaders defining them.
///
/// All mutation and every snapshot go through one registry-wide lock that is only held for the
/// duration of the call, so readers see a registry either before or after a mutation.
pub struct ClassRegistry {
	inner: RwLock<RegistryInner>,
	boot_loader: LoaderId,
	instance_classes: AtomicUsize,
	array_classes: AtomicUsize,
}

impl ClassRegistry {
	pub fn new(boot_sources: Vec<Box<dyn ClassSource>>) -> ClassRegistry {
		let mut inner = RegistryInner {
			classes: Storage::new(),
			by_name: AHashMap::new(),
			loaders: BTreeMap::new(),
			next_loader: 0,
			generation: 0,
		};
		let boot_loader = inner.add_loader("bootstrap".to_string(), true, boot_sources);

		ClassRegistry {
			inner: RwLock::new(inner),
			boot_loader,
			instance_classes: AtomicUsize::new(0),
			array_classes: AtomicUsize::new(0),
		}
	}

	pub fn boot_loader(&self) -> LoaderId {
		self.boot_loader
	}

	pub fn new_loader(
		&self,
		name: impl Into<String>,
		sources: Vec<Box<dyn ClassSource>>,
	) -> LoaderId {
		let name = name.into();
		let id = self.inner.write().add_loader(name.clone(), false, sources);
		debug!("Created class loader {name} as {id:?}");
		id
	}

	pub fn loader(&self, id: LoaderId) -> Option<Arc<LoaderData>> {
		self.inner.read().loaders.get(&id).map(|entry| entry.data.clone())
	}

	/// Loaders that have not been unloaded, in creation order.
	pub fn loaders(&self) -> Vec<Arc<LoaderData>> {
		self.inner
			.read()
			.loaders
			.values()
			.filter(|entry| !entry.data.is_unloading())
			.map(|entry| entry.data.clone())
			.collect()
	}

	/// Classes currently defined by a loader, ascending by id.
	pub fn classes_of(&self, loader: LoaderId) -> Vec<Arc<ClassDescriptor>> {
		let guard = self.inner.read();
		let Some(entry) = guard.loaders.get(&loader) else {
			return vec![];
		};
		entry
			.classes
			.iter()
			.filter_map(|id| guard.classes.get(*id).cloned())
			.collect()
	}

	/// Defines a class. Re-inserting an identical array class returns the existing descriptor.
	pub fn insert(&self, definition: ClassDefinition) -> Result<InsertOutcome, ClassError> {
		let name = definition.ty.name();
		let loader = definition.loader;

		let mut guard = self.inner.write();
		let entry = guard
			.loaders
			.get(&loader)
			.ok_or(ClassError::UnknownLoader(loader))?;
		if entry.data.is_unloading() {
			return Err(ClassError::LoaderUnloading(loader));
		}

		match &definition.kind {
			ClassKind::Ordinary if definition.ty.is_array() => {
				return Err(ClassError::InvalidName(name));
			}
			ClassKind::Ordinary => {}
			ClassKind::Array(array) => {
				// An array class may only exist while its component does.
				if !guard.classes.contains_id(array.component.id) {
					return Err(ClassError::ComponentNotLoaded {
						name: array.component.name.clone(),
					});
				}
			}
		}

		let key = ClassKey {
			loader,
			name: name.clone(),
		};
		let kind = definition.kind.clone();
		let id = match guard
			.classes
			.try_insert_with(key, |id| Arc::new(ClassDescriptor::new(id, definition)))
		{
			Ok(id) => id,
			Err(existing) => {
				let existing = guard
					.classes
					.get(existing)
					.cloned()
					.expect("Lookup points to a removed class");
				if existing.is_array() && existing.kind() == &kind {
					return Ok(InsertOutcome::Existing(existing));
				}
				return Err(ClassError::DuplicateClass { name, loader });
			}
		};

		guard.by_name.entry(name.clone()).or_default().insert(id);
		if let Some(entry) = guard.loaders.get_mut(&loader) {
			entry.classes.insert(id);
		}
		guard.generation += 1;
		let descriptor = guard
			.classes
			.get(id)
			.cloned()
			.expect("Class was just inserted");
		// Counted under the lock so counts never disagree with membership.
		if descriptor.is_array() {
			self.array_classes.fetch_add(1, Ordering::Relaxed);
		} else {
			self.instance_classes.fetch_add(1, Ordering::Relaxed);
		}
		drop(guard);
		info!("Loaded class {name} at {id:?} by {loader:?}");
		Ok(InsertOutcome::Defined(descriptor))
	}

	/// Loads a class by binary name through the loader's sources, or returns the class the loader
	/// already defined under that name.
	pub fn load_class(&self, loader: LoaderId, name: &str) -> eyre::Result<Arc<ClassDescriptor>> {
		let ty = match Type::parse_name(name) {
			Some(Type::Object(object)) => object,
			_ => return Err(ClassError::InvalidName(name.to_string()).into()),
		};

		if let Some(existing) = self.lookup_in(loader, name) {
			return Ok(existing);
		}

		let data = self.loader(loader).ok_or(ClassError::UnknownLoader(loader))?;
		if data.is_unloading() {
			return Err(ClassError::LoaderUnloading(loader).into());
		}

		let bytes = data
			.find_class(&ty)
			.wrap_err_with(|| format!("Loading {name}"))?
			.ok_or_else(|| ClassError::ClassNotFound {
				name: name.to_string(),
				loader,
			})?;

		match self.insert(ClassDefinition::ordinary(Type::Object(ty), loader, bytes.len())) {
			Ok(outcome) => Ok(outcome.into_descriptor()),
			// Another thread won the race to define it.
			Err(ClassError::DuplicateClass { .. }) => self
				.lookup_in(loader, name)
				.ok_or_else(|| eyre::eyre!("Class {name} vanished while being defined")),
			Err(error) => Err(error.into()),
		}
	}

	pub fn get(&self, id: ClassId) -> Option<Arc<ClassDescriptor>> {
		self.inner.read().classes.get(id).cloned()
	}

	pub fn contains(&self, id: ClassId) -> bool {
		self.inner.read().classes.contains_id(id)
	}

	/// The most recently defined class with this name, from any loader.
	pub fn lookup(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
		let guard = self.inner.read();
		let id = *guard.by_name.get(name)?.last()?;
		guard.classes.get(id).cloned()
	}

	pub fn lookup_in(&self, loader: LoaderId, name: &str) -> Option<Arc<ClassDescriptor>> {
		let key = ClassKey {
			loader,
			name: name.to_string(),
		};
		self.inner.read().classes.get_keyed(&key).cloned()
	}

	/// Whether any loader currently defines a class with this name.
	pub fn contains_name(&self, name: &str) -> bool {
		self.inner
			.read()
			.by_name
			.get(name)
			.is_some_and(|ids| !ids.is_empty())
	}

	/// A point-in-time copy of the registry, classes in insertion order.
	pub fn snapshot(&self) -> RegistrySnapshot {
		let guard = self.inner.read();
		RegistrySnapshot {
			generation: guard.generation,
			counts: self.load_counts(),
			classes: guard.classes.iter().map(|(_, class)| class.clone()).collect(),
			loaders: guard
				.loaders
				.values()
				.map(|entry| entry.data.clone())
				.collect(),
		}
	}

	/// Removes classes in one atomic step.
	///
	/// The batch is closed over array classes whose component is removed, including array classes
	/// defined after the caller took its snapshot. Returns what was actually removed, ascending by id.
	pub fn remove_batch(&self, ids: &[ClassId]) -> Vec<Arc<ClassDescriptor>> {
		let mut guard = self.inner.write();

		let mut doomed: BTreeSet<ClassId> = ids
			.iter()
			.copied()
			.filter(|id| guard.classes.contains_id(*id))
			.collect();
		loop {
			let dependents: Vec<ClassId> = guard
				.classes
				.iter()
				.filter(|(id, class)| {
					!doomed.contains(id)
						&& class
							.array()
							.is_some_and(|array| doomed.contains(&array.component.id))
				})
				.map(|(id, _)| id)
				.collect();
			if dependents.is_empty() {
				break;
			}
			doomed.extend(dependents);
		}

		let mut removed = Vec::with_capacity(doomed.len());
		for id in doomed {
			let Some(class) = guard.classes.remove(id) else {
				continue;
			};
			if let Some(ids) = guard.by_name.get_mut(class.name()) {
				ids.remove(&id);
				if ids.is_empty() {
					guard.by_name.remove(class.name());
				}
			}
			if let Some(entry) = guard.loaders.get_mut(&class.loader()) {
				entry.classes.remove(&id);
			}
			if class.is_array() {
				self.array_classes.fetch_sub(1, Ordering::Relaxed);
			} else {
				self.instance_classes.fetch_sub(1, Ordering::Relaxed);
			}
			removed.push(class);
		}
		if !removed.is_empty() {
			guard.generation += 1;
		}
		removed
	}

	/// Marks loaders as unloading and drops them from the loader graph.
	///
	/// Permanent loaders and loaders that still define classes are skipped.
	pub fn unload_loaders(&self, candidates: &[LoaderId]) -> Vec<Arc<LoaderData>> {
		let mut guard = self.inner.write();
		let mut unloaded = vec![];
		for id in candidates {
			let Some(entry) = guard.loaders.get(id) else {
				continue;
			};
			if entry.data.is_permanent() {
				warn!("Refusing to unload permanent loader {id:?}");
				continue;
			}
			if !entry.classes.is_empty() {
				continue;
			}
			if let Some(entry) = guard.loaders.remove(id) {
				entry.data.mark_unloading();
				unloaded.push(entry.data);
			}
		}
		unloaded
	}

	pub fn counts(&self) -> ClassCounts {
		let _guard = self.inner.read();
		self.load_counts()
	}

	/// Callers hold the registry lock.
	fn load_counts(&self) -> ClassCounts {
		ClassCounts {
			instance_classes: self.instance_classes.load(Ordering::Relaxed),
			array_classes: self.array_classes.load(Ordering::Relaxed),
		}
	}

	/// Bumped by every mutation of the class table.
	pub fn generation(&self) -> u64 {
		self.inner.read().generation
	}

	pub fn len(&self) -> usize {
		self.inner.read().classes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for ClassRegistry {
	fn default() -> Self {
		ClassRegistry::new(vec![])
	}
}

pub enum InsertOutcome {
	Defined(Arc<ClassDescriptor>),
	Existing(Arc<ClassDescriptor>),
}

impl InsertOutcome {
	pub fn handle(&self) -> ClassId {
		self.descriptor().id()
	}

	pub fn descriptor(&self) -> &Arc<ClassDescriptor> {
		match self {
			InsertOutcome::Defined(class) | InsertOutcome::Existing(class) => class,
		}
	}

	pub fn into_descriptor(self) -> Arc<ClassDescriptor> {
		match self {
			InsertOutcome::Defined(class) | InsertOutcome::Existing(class) => class,
		}
	}

	pub fn is_new(&self) -> bool {
		matches!(self, InsertOutcome::Defined(_))
	}
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassCounts {
	pub instance_classes: usize,
	pub array_classes: usize,
}

/// Immutable view of the registry taken under its lock.
#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
	generation: u64,
	counts: ClassCounts,
	classes: Vec<Arc<ClassDescriptor>>,
	loaders: Vec<Arc<LoaderData>>,
}

impl RegistrySnapshot {
	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Class counts as of the snapshot.
	pub fn counts(&self) -> ClassCounts {
		self.counts
	}

	/// Classes ascending by id, which is insertion order.
	pub fn classes(&self) -> &[Arc<ClassDescriptor>] {
		&self.classes
	}

	/// Loaders ascending by id.
	pub fn loaders(&self) -> &[Arc<LoaderData>] {
		&self.loaders
	}

	pub fn loader(&self, id: LoaderId) -> Option<&Arc<LoaderData>> {
		self.loaders
			.binary_search_by_key(&id, |loader| loader.id())
			.ok()
			.map(|idx| &self.loaders[idx])
	}

	pub fn get(&self, id: ClassId) -> Option<&Arc<ClassDescriptor>> {
		self.classes
			.binary_search_by_key(&id, |class| class.id())
			.ok()
			.map(|idx| &self.classes[idx])
	}

	pub fn len(&self) -> usize {
		self.classes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.classes.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::MemoryClassSource;
	use rvm_core::ObjectType;

	fn classes() -> MemoryClassSource {
		MemoryClassSource::new()
			.with("test.Empty", vec![0xCA, 0xFE, 0xBA, 0xBE])
			.with("test.Other", vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0])
	}

	fn registry_with_loader() -> (ClassRegistry, LoaderId) {
		rvm_core::init();
		let registry = ClassRegistry::default();
		let loader = registry.new_loader("app", vec![Box::new(classes())]);
		(registry, loader)
	}

	#[test]
	fn load_defines_once() {
		let (registry, loader) = registry_with_loader();
		assert!(!registry.contains_name("test.Empty"));

		let first = registry.load_class(loader, "test.Empty").unwrap();
		let second = registry.load_class(loader, "test.Empty").unwrap();
		assert!(Arc::ptr_eq(&first, &second));
		assert_eq!(first.size(), 4);
		assert!(registry.contains_name("test.Empty"));
		assert_eq!(
			registry.counts(),
			ClassCounts {
				instance_classes: 1,
				array_classes: 0
			}
		);
	}

	#[test]
	fn duplicate_ordinary_insert_fails() {
		let (registry, loader) = registry_with_loader();
		registry.load_class(loader, "test.Empty").unwrap();

		let error = registry
			.insert(ClassDefinition::ordinary(
				Type::Object(ObjectType::new("test.Empty")),
				loader,
				4,
			))
			.err()
			.unwrap();
		assert_eq!(
			error,
			ClassError::DuplicateClass {
				name: "test.Empty".to_string(),
				loader
			}
		);
		assert_eq!(registry.len(), 1);
	}

	#[test]
	fn same_name_in_two_loaders() {
		let (registry, first_loader) = registry_with_loader();
		let second_loader = registry.new_loader("other", vec![Box::new(classes())]);

		let first = registry.load_class(first_loader, "test.Empty").unwrap();
		let second = registry.load_class(second_loader, "test.Empty").unwrap();
		assert_ne!(first.id(), second.id());
		assert_eq!(registry.lookup("test.Empty").unwrap().id(), second.id());

		registry.remove_batch(&[second.id()]);
		assert!(registry.contains_name("test.Empty"));
		assert_eq!(registry.lookup("test.Empty").unwrap().id(), first.id());
	}

	#[test]
	fn load_errors() {
		let (registry, loader) = registry_with_loader();

		let missing = registry.load_class(loader, "test.Missing").unwrap_err();
		assert_eq!(
			missing.downcast_ref::<ClassError>(),
			Some(&ClassError::ClassNotFound {
				name: "test.Missing".to_string(),
				loader
			})
		);

		let array = registry.load_class(loader, "[Ltest.Empty;").unwrap_err();
		assert!(matches!(
			array.downcast_ref::<ClassError>(),
			Some(ClassError::InvalidName(_))
		));

		let unknown = registry
			.load_class(Id::new(99), "test.Empty")
			.unwrap_err();
		assert!(matches!(
			unknown.downcast_ref::<ClassError>(),
			Some(ClassError::UnknownLoader(_))
		));
		assert!(registry.is_empty());
	}

	#[test]
	fn ordinary_definition_of_array_type_is_rejected() {
		let (registry, loader) = registry_with_loader();
		let ty = Type::Object(ObjectType::new("test.Empty")).array_of(1);
		assert!(matches!(
			registry.insert(ClassDefinition::ordinary(ty, loader, 0)),
			Err(ClassError::InvalidName(_))
		));
	}

	#[test]
	fn snapshot_is_in_insertion_order() {
		let (registry, loader) = registry_with_loader();
		let empty = registry.load_class(loader, "test.Empty").unwrap();
		let other = registry.load_class(loader, "test.Other").unwrap();
		let array = registry.derive_array_class(&empty, 1).unwrap();

		let snapshot = registry.snapshot();
		let ids: Vec<_> = snapshot.classes().iter().map(|class| class.id()).collect();
		assert_eq!(ids, vec![empty.id(), other.id(), array.id()]);
		assert_eq!(snapshot.get(other.id()).unwrap().name(), "test.Other");
		assert_eq!(snapshot.loaders().len(), 2);

		// Later mutation does not show up in an earlier snapshot.
		registry.remove_batch(&[other.id()]);
		assert_eq!(snapshot.len(), 3);
		assert!(snapshot.generation() < registry.generation());
	}

	#[test]
	fn remove_batch_closes_over_arrays() {
		let (registry, loader) = registry_with_loader();
		let empty = registry.load_class(loader, "test.Empty").unwrap();
		let snapshot = registry.snapshot();
		// Derived after the snapshot was taken.
		let matrix = registry.derive_array_class(&empty, 2).unwrap();

		let dead: Vec<_> = snapshot.classes().iter().map(|class| class.id()).collect();
		let removed = registry.remove_batch(&dead);
		let names: Vec<_> = removed.iter().map(|class| class.name().to_string()).collect();
		assert_eq!(names, vec!["test.Empty", "[Ltest.Empty;", "[[Ltest.Empty;"]);
		assert!(!registry.contains(matrix.id()));
		assert_eq!(registry.counts(), ClassCounts::default());
		assert!(registry.classes_of(loader).is_empty());
	}

	#[test]
	fn unloading_loaders() {
		let (registry, loader) = registry_with_loader();
		let empty = registry.load_class(loader, "test.Empty").unwrap();

		// Still defines a class.
		assert!(registry.unload_loaders(&[loader]).is_empty());
		// The boot loader never goes away.
		assert!(registry.unload_loaders(&[registry.boot_loader()]).is_empty());

		registry.remove_batch(&[empty.id()]);
		let data = registry.loader(loader).unwrap();
		let unloaded = registry.unload_loaders(&[loader]);
		assert_eq!(unloaded.len(), 1);
		assert!(data.is_unloading());
		assert!(registry.loader(loader).is_none());
		assert_eq!(registry.loaders().len(), 1);

		let error = registry.load_class(loader, "test.Empty").unwrap_err();
		assert!(matches!(
			error.downcast_ref::<ClassError>(),
			Some(ClassError::UnknownLoader(_))
		));
	}

	#[test]
	fn reinserting_an_array_class_returns_it() {
		let (registry, loader) = registry_with_loader();
		let empty = registry.load_class(loader, "test.Empty").unwrap();

		let first = registry.insert(ClassDefinition::array(&empty)).unwrap();
		let second = registry.insert(ClassDefinition::array(&empty)).unwrap();
		assert!(first.is_new());
		assert!(!second.is_new());
		assert_eq!(first.handle(), second.handle());
		assert!(Arc::ptr_eq(first.descriptor(), second.descriptor()));
		assert_eq!(registry.counts().array_classes, 1);
		assert_eq!(registry.len(), 2);
	}

	#[test]
	fn counts_agree_with_membership() {
		let (registry, loader) = registry_with_loader();
		let done = std::sync::atomic::AtomicBool::new(false);

		std::thread::scope(|scope| {
			scope.spawn(|| {
				for _ in 0..200 {
					let empty = registry.load_class(loader, "test.Empty").unwrap();
					registry.derive_array_class(&empty, 2).unwrap();
					registry.remove_batch(&[empty.id()]);
				}
				done.store(true, Ordering::Relaxed);
			});

			while !done.load(Ordering::Relaxed) {
				let snapshot = registry.snapshot();
				let arrays = snapshot.classes().iter().filter(|class| class.is_array()).count();
				assert_eq!(
					snapshot.counts(),
					ClassCounts {
						instance_classes: snapshot.len() - arrays,
						array_classes: arrays
					}
				);
			}
		});
		assert_eq!(registry.counts(), ClassCounts::default());
	}
}
