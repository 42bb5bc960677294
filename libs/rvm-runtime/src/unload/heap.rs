use crate::gc::{HeapRoots, JavaHeap, JavaObject};
use crate::unload::{CycleReport, Liveness, LivenessQuery, OracleError, ReachabilityOracle};
use ahash::AHashSet;
use rvm_class::{ClassDescriptor, ClassId, LoaderData, LoaderId, RegistrySnapshot};
use std::sync::Arc;
use tracing::{debug, info};

/// Answers liveness from a mark of the Java heap.
///
/// The mark runs at the start of a cycle and the heap is swept once the cycle completed, so
/// metadata objects of evicted classes go away together with their classes.
pub struct HeapOracle {
	heap: Arc<JavaHeap>,
	class_unloading: bool,
	instance_classes: AHashSet<ClassId>,
	referenced: AHashSet<ClassId>,
	live_loaders: AHashSet<LoaderId>,
}

impl HeapOracle {
	pub fn new(heap: Arc<JavaHeap>, class_unloading: bool) -> HeapOracle {
		HeapOracle {
			heap,
			class_unloading,
			instance_classes: AHashSet::new(),
			referenced: AHashSet::new(),
			live_loaders: AHashSet::new(),
		}
	}

	fn loader_alive(&self, loader: &LoaderData) -> bool {
		!loader.is_unloading()
			&& (loader.is_permanent() || self.live_loaders.contains(&loader.id()))
	}

	fn class_alive(&self, class: &ClassDescriptor, snapshot: &RegistrySnapshot) -> bool {
		self.instance_classes.contains(&class.id())
			|| self.referenced.contains(&class.id())
			|| snapshot
				.loader(class.loader())
				.is_some_and(|loader| self.loader_alive(loader))
	}
}

impl ReachabilityOracle for HeapOracle {
	fn begin_cycle(&mut self, snapshot: &RegistrySnapshot) -> Result<(), OracleError> {
		self.instance_classes.clear();
		self.referenced.clear();
		self.live_loaders.clear();

		{
			let _safepoint = self.heap.safepoint.write();
			let roots = HeapRoots {
				heap: &self.heap,
				strong_metadata: !self.class_unloading,
			};
			let marked = self.heap.gc.mark(&roots);
			debug!(target: "gc", "Marked {marked} reachable objects");

			// Loaders still waiting for their holder object.
			let holders = self.heap.loader_objects.read();
			for loader in snapshot.loaders() {
				if !holders.contains_key(&loader.id()) {
					self.live_loaders.insert(loader.id());
				}
			}
		}

		self.heap.gc.walk_alive(|_, object| match object {
			JavaObject::Instance { class, .. } | JavaObject::Array { class, .. } => {
				self.instance_classes.insert(*class);
			}
			JavaObject::Mirror { class, .. } => {
				self.referenced.insert(*class);
			}
			JavaObject::Loader { loader, .. } => {
				self.live_loaders.insert(*loader);
			}
		});

		// A live class keeps its component and its loader alive.
		loop {
			let mut changed = false;
			for class in snapshot.classes() {
				if !self.class_alive(class, snapshot) {
					continue;
				}
				if let Some(array) = class.array() {
					changed |= self.referenced.insert(array.component().id());
				}
				changed |= self.live_loaders.insert(class.loader());
			}
			if !changed {
				break;
			}
		}

		Ok(())
	}

	fn query(&mut self, query: &LivenessQuery<'_>) -> Result<Liveness, OracleError> {
		let id = query.class.id();
		Ok(Liveness {
			instances_reachable: self.instance_classes.contains(&id),
			referenced_as_metadata: self.referenced.contains(&id),
			loader_alive: query.loader.is_some_and(|loader| self.loader_alive(loader)),
		})
	}

	fn query_loader(&mut self, loader: &LoaderData) -> Result<bool, OracleError> {
		Ok(self.loader_alive(loader))
	}

	fn end_cycle(&mut self, report: &CycleReport) {
		let statistics = self.heap.gc.sweep();
		{
			let mut mirrors = self.heap.mirrors.write();
			for class in &report.unloaded {
				mirrors.remove(&class.id());
			}
		}
		{
			let mut loader_objects = self.heap.loader_objects.write();
			for loader in &report.unloaded_loaders {
				loader_objects.remove(&loader.id());
			}
		}
		*self.heap.last_collection.lock() = statistics;

		info!(
			target: "gc",
			"Pause Full ({}) cleared {} objects, {} remaining, {}/{} bytes",
			report.cycle(),
			statistics.objects_cleared,
			statistics.objects_remaining,
			self.heap.gc.used(),
			self.heap.gc.size()
		);
	}
}
