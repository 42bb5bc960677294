use crate::unload::{
	EventPublisher, LivenessQuery, OracleError, ReachabilityOracle, UnloadEvent, UnloadStatistics,
};
use crossbeam::channel::Receiver;
use parking_lot::{Condvar, Mutex};
use rvm_class::{ClassDescriptor, ClassId, ClassRegistry, LoaderData, LoaderId, RegistrySnapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnloadPhase {
	Idle,
	Scanning,
	Deciding,
	Evicting,
}

/// Outcome of one completed cycle.
#[derive(Clone, Debug)]
pub struct CycleReport {
	pub statistics: UnloadStatistics,
	/// Evicted classes in the order their events were published.
	pub unloaded: Vec<Arc<ClassDescriptor>>,
	pub unloaded_loaders: Vec<Arc<LoaderData>>,
	/// The trigger joined a cycle that was already running.
	pub coalesced: bool,
}

impl CycleReport {
	pub fn cycle(&self) -> u64 {
		self.statistics.cycle
	}

	pub fn unloaded_names(&self) -> Vec<&str> {
		self.unloaded.iter().map(|class| class.name()).collect()
	}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnloadError {
	#[error("Unload cycle {cycle} aborted by the reachability oracle")]
	Oracle {
		cycle: u64,
		#[source]
		source: OracleError,
	},
	#[error("Unload cycle {cycle} panicked")]
	Panicked { cycle: u64 },
}

struct CoordinatorState {
	phase: UnloadPhase,
	started: u64,
	completed: u64,
	coalesced: u64,
	/// Triggers waiting on a running cycle, keyed by that cycle.
	joined: BTreeMap<u64, Joined>,
}

#[derive(Default)]
struct Joined {
	waiting: usize,
	outcome: Option<Result<CycleReport, UnloadError>>,
}

/// Decides after every collection which classes are no longer reachable and evicts them.
///
/// Only one cycle runs at a time. A trigger arriving while a cycle runs waits for that cycle and
/// shares its outcome.
pub struct UnloadCoordinator<O: ReachabilityOracle> {
	registry: Arc<ClassRegistry>,
	oracle: Mutex<O>,
	state: Mutex<CoordinatorState>,
	finished: Condvar,
	events: EventPublisher,
	class_unloading: bool,
}

impl<O: ReachabilityOracle> UnloadCoordinator<O> {
	pub fn new(registry: Arc<ClassRegistry>, oracle: O) -> UnloadCoordinator<O> {
		UnloadCoordinator {
			registry,
			oracle: Mutex::new(oracle),
			state: Mutex::new(CoordinatorState {
				phase: UnloadPhase::Idle,
				started: 0,
				completed: 0,
				coalesced: 0,
				joined: BTreeMap::new(),
			}),
			finished: Condvar::new(),
			events: EventPublisher::default(),
			class_unloading: true,
		}
	}

	/// With class unloading disabled cycles still run the oracle but never evict anything.
	pub fn with_class_unloading(mut self, enabled: bool) -> UnloadCoordinator<O> {
		self.class_unloading = enabled;
		self
	}

	pub fn registry(&self) -> &Arc<ClassRegistry> {
		&self.registry
	}

	pub fn phase(&self) -> UnloadPhase {
		self.state.lock().phase
	}

	/// Number of completed cycles.
	pub fn cycles(&self) -> u64 {
		self.state.lock().completed
	}

	/// Number of triggers that joined a running cycle instead of starting one.
	pub fn coalesced_triggers(&self) -> u64 {
		self.state.lock().coalesced
	}

	/// Receives every unload event published from now on.
	pub fn subscribe(&self) -> Receiver<UnloadEvent> {
		self.events.subscribe()
	}

	/// Runs a cycle, or waits for the running one, and returns its outcome.
	pub fn trigger(&self) -> Result<CycleReport, UnloadError> {
		let mut state = self.state.lock();
		if state.phase != UnloadPhase::Idle {
			let cycle = state.started;
			state.coalesced += 1;
			state.joined.entry(cycle).or_default().waiting += 1;
			debug!(target: "class_unload", "Joining unload cycle {cycle} in progress");
			while state.completed < cycle {
				self.finished.wait(&mut state);
			}

			// A later cycle may already have completed, so only this cycle's outcome is taken.
			let remaining = state.joined.get_mut(&cycle).map(|joined| {
				joined.waiting -= 1;
				joined.waiting
			});
			let outcome = if remaining == Some(0) {
				state.joined.remove(&cycle).and_then(|joined| joined.outcome)
			} else {
				state.joined.get(&cycle).and_then(|joined| joined.outcome.clone())
			};
			return match outcome {
				Some(Ok(mut report)) => {
					report.coalesced = true;
					Ok(report)
				}
				Some(Err(error)) => Err(error),
				None => panic!("Unload cycle {cycle} completed without an outcome"),
			};
		}

		state.started += 1;
		let cycle = state.started;
		state.phase = UnloadPhase::Scanning;
		drop(state);

		let mut guard = CycleGuard {
			coordinator: self,
			cycle,
			outcome: None,
		};
		let outcome = self.run_cycle(cycle);
		guard.outcome = Some(outcome.clone());
		drop(guard);
		outcome
	}

	fn set_phase(&self, phase: UnloadPhase) {
		self.state.lock().phase = phase;
	}

	fn run_cycle(&self, cycle: u64) -> Result<CycleReport, UnloadError> {
		let start = Instant::now();
		let mut oracle = self.oracle.lock();

		debug!(target: "class_unload", "Unload cycle {cycle}: scanning");
		let snapshot = self.registry.snapshot();
		oracle
			.begin_cycle(&snapshot)
			.map_err(|source| Self::abort(cycle, source))?;

		self.set_phase(UnloadPhase::Deciding);
		let (dead, dead_loaders) = if self.class_unloading {
			Self::decide(&mut *oracle, &snapshot).map_err(|source| Self::abort(cycle, source))?
		} else {
			(BTreeSet::new(), vec![])
		};
		debug!(
			target: "class_unload",
			"Unload cycle {cycle}: {} of {} classes unreachable",
			dead.len(),
			snapshot.len()
		);

		self.set_phase(UnloadPhase::Evicting);
		let dead: Vec<ClassId> = dead.into_iter().collect();
		let mut unloaded = self.registry.remove_batch(&dead);
		unloaded.sort_by_key(|class| UnloadEvent::order_key(class));
		let unloaded_loaders = self.registry.unload_loaders(&dead_loaders);

		for class in &unloaded {
			self.events.publish(&UnloadEvent::new(cycle, class));
		}
		for loader in &unloaded_loaders {
			debug!(target: "class_unload", "unloading loader {} {}", loader.name(), loader.id());
		}

		let array_classes_unloaded = unloaded.iter().filter(|class| class.is_array()).count();
		let report = CycleReport {
			statistics: UnloadStatistics {
				cycle,
				classes_scanned: snapshot.len(),
				classes_unloaded: unloaded.len() - array_classes_unloaded,
				array_classes_unloaded,
				loaders_unloaded: unloaded_loaders.len(),
				duration: start.elapsed(),
			},
			unloaded,
			unloaded_loaders,
			coalesced: false,
		};
		oracle.end_cycle(&report);

		info!(
			target: "class_unload",
			"Unload cycle {cycle}: scanned {}, unloaded {} classes, {} array classes and {} loaders in {:?}",
			report.statistics.classes_scanned,
			report.statistics.classes_unloaded,
			report.statistics.array_classes_unloaded,
			report.statistics.loaders_unloaded,
			report.statistics.duration
		);
		Ok(report)
	}

	fn decide(
		oracle: &mut O,
		snapshot: &RegistrySnapshot,
	) -> Result<(BTreeSet<ClassId>, Vec<LoaderId>), OracleError> {
		let mut dead = BTreeSet::new();
		for class in snapshot.classes() {
			let query = LivenessQuery {
				class,
				loader: snapshot.loader(class.loader()),
			};
			let liveness = oracle.query(&query)?;
			trace!(target: "class_unload", "{} {:?}", class.name(), liveness);
			if !liveness.is_live() {
				dead.insert(class.id());
			}
		}

		// An array class never outlives its component.
		loop {
			let before = dead.len();
			for class in snapshot.classes() {
				let Some(array) = class.array() else {
					continue;
				};
				let component = array.component().id();
				if dead.contains(&component) || snapshot.get(component).is_none() {
					dead.insert(class.id());
				}
			}
			if dead.len() == before {
				break;
			}
		}

		let mut dead_loaders = vec![];
		for loader in snapshot.loaders() {
			if loader.is_permanent() || loader.is_unloading() {
				continue;
			}
			if !oracle.query_loader(loader)? {
				dead_loaders.push(loader.id());
			}
		}

		Ok((dead, dead_loaders))
	}

	fn abort(cycle: u64, source: OracleError) -> UnloadError {
		warn!(target: "class_unload", "Unload cycle {cycle} aborted: {source}");
		UnloadError::Oracle { cycle, source }
	}
}

/// Publishes the outcome of a cycle and returns the coordinator to idle, also when the cycle
/// unwinds.
struct CycleGuard<'a, O: ReachabilityOracle> {
	coordinator: &'a UnloadCoordinator<O>,
	cycle: u64,
	outcome: Option<Result<CycleReport, UnloadError>>,
}

impl<O: ReachabilityOracle> Drop for CycleGuard<'_, O> {
	fn drop(&mut self) {
		let cycle = self.cycle;
		let mut state = self.coordinator.state.lock();
		state.phase = UnloadPhase::Idle;
		state.completed = cycle;
		let outcome = self
			.outcome
			.take()
			.unwrap_or(Err(UnloadError::Panicked { cycle }));
		if let Some(joined) = state.joined.get_mut(&cycle) {
			joined.outcome = Some(outcome);
		}
		self.coordinator.finished.notify_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::unload::{Liveness, UnloadKind};
	use ahash::AHashSet;
	use crossbeam::channel::{bounded, Sender};
	use rvm_class::MemoryClassSource;
	use std::thread;

	/// Answers from a fixed set of live class names.
	#[derive(Default)]
	struct ScriptedOracle {
		live: AHashSet<String>,
		metadata: AHashSet<String>,
		dead_loaders: AHashSet<String>,
		fail_on: Option<String>,
		cycles: Arc<Mutex<Vec<usize>>>,
	}

	impl ReachabilityOracle for ScriptedOracle {
		fn begin_cycle(&mut self, snapshot: &RegistrySnapshot) -> Result<(), OracleError> {
			self.cycles.lock().push(snapshot.len());
			Ok(())
		}

		fn query(&mut self, query: &LivenessQuery<'_>) -> Result<Liveness, OracleError> {
			let name = query.class.name();
			if self.fail_on.as_deref() == Some(name) {
				return Err(OracleError::Unavailable(format!("no answer for {name}")));
			}
			Ok(Liveness {
				instances_reachable: self.live.contains(name),
				referenced_as_metadata: self.metadata.contains(name),
				loader_alive: false,
			})
		}

		fn query_loader(&mut self, loader: &LoaderData) -> Result<bool, OracleError> {
			Ok(!self.dead_loaders.contains(loader.name()))
		}
	}

	fn setup() -> (Arc<ClassRegistry>, LoaderId) {
		rvm_core::init();
		let registry = Arc::new(ClassRegistry::default());
		let loader = registry.new_loader(
			"app",
			vec![Box::new(
				MemoryClassSource::new()
					.with("test.Empty", vec![0xCA, 0xFE, 0xBA, 0xBE])
					.with("test.Other", vec![0xCA, 0xFE, 0xBA, 0xBE]),
			)],
		);
		(registry, loader)
	}

	fn live(names: &[&str]) -> AHashSet<String> {
		names.iter().map(|name| name.to_string()).collect()
	}

	#[test]
	fn evicts_arrays_before_components() {
		let (registry, loader) = setup();
		let empty = registry.load_class(loader, "test.Empty").unwrap();
		registry.derive_array_class(&empty, 2).unwrap();
		registry.load_class(loader, "test.Other").unwrap();

		let coordinator = UnloadCoordinator::new(
			registry.clone(),
			ScriptedOracle {
				live: live(&["test.Other"]),
				..Default::default()
			},
		);
		let events = coordinator.subscribe();
		let report = coordinator.trigger().unwrap();

		assert_eq!(
			report.unloaded_names(),
			vec!["[[Ltest.Empty;", "[Ltest.Empty;", "test.Empty"]
		);
		assert_eq!(report.statistics.classes_scanned, 4);
		assert_eq!(report.statistics.classes_unloaded, 1);
		assert_eq!(report.statistics.array_classes_unloaded, 2);
		assert!(!report.coalesced);

		let events: Vec<UnloadEvent> = events.try_iter().collect();
		assert_eq!(events.len(), 3);
		assert_eq!(events[0].kind, UnloadKind::Array { dimensions: 2 });
		assert_eq!(events[2].kind, UnloadKind::Ordinary);
		assert!(events.iter().all(|event| event.cycle == 1 && event.loader == loader));

		assert!(registry.contains_name("test.Other"));
		assert!(!registry.contains_name("test.Empty"));
		assert_eq!(coordinator.phase(), UnloadPhase::Idle);
		assert_eq!(coordinator.cycles(), 1);
	}

	#[test]
	fn dead_component_takes_live_array_along() {
		let (registry, loader) = setup();
		let empty = registry.load_class(loader, "test.Empty").unwrap();
		let array = registry.derive_array_class(&empty, 1).unwrap();

		let coordinator = UnloadCoordinator::new(
			registry.clone(),
			ScriptedOracle {
				live: live(&["[Ltest.Empty;"]),
				..Default::default()
			},
		);
		let report = coordinator.trigger().unwrap();

		assert_eq!(report.unloaded_names(), vec!["[Ltest.Empty;", "test.Empty"]);
		assert!(!registry.contains(array.id()));
	}

	#[test]
	fn live_component_does_not_keep_array() {
		let (registry, loader) = setup();
		let empty = registry.load_class(loader, "test.Empty").unwrap();
		registry.derive_array_class(&empty, 1).unwrap();

		let coordinator = UnloadCoordinator::new(
			registry.clone(),
			ScriptedOracle {
				metadata: live(&["test.Empty"]),
				..Default::default()
			},
		);
		let report = coordinator.trigger().unwrap();

		assert_eq!(report.unloaded_names(), vec!["[Ltest.Empty;"]);
		assert!(registry.contains(empty.id()));
	}

	#[test]
	fn oracle_failure_leaves_registry_untouched() {
		let (registry, loader) = setup();
		let empty = registry.load_class(loader, "test.Empty").unwrap();
		registry.derive_array_class(&empty, 1).unwrap();
		let generation = registry.generation();

		let coordinator = UnloadCoordinator::new(
			registry.clone(),
			ScriptedOracle {
				fail_on: Some("[Ltest.Empty;".to_string()),
				..Default::default()
			},
		);
		let events = coordinator.subscribe();
		let error = coordinator.trigger().unwrap_err();

		assert!(matches!(
			error,
			UnloadError::Oracle {
				cycle: 1,
				source: OracleError::Unavailable(_)
			}
		));
		assert_eq!(registry.generation(), generation);
		assert_eq!(registry.len(), 2);
		assert!(events.try_recv().is_err());
		assert_eq!(coordinator.phase(), UnloadPhase::Idle);
	}

	#[test]
	fn disabled_class_unloading_evicts_nothing() {
		let (registry, loader) = setup();
		registry.load_class(loader, "test.Empty").unwrap();
		let cycles = Arc::new(Mutex::new(vec![]));

		let coordinator = UnloadCoordinator::new(
			registry.clone(),
			ScriptedOracle {
				cycles: cycles.clone(),
				..Default::default()
			},
		)
		.with_class_unloading(false);
		let report = coordinator.trigger().unwrap();

		assert!(report.unloaded.is_empty());
		assert!(registry.contains_name("test.Empty"));
		// The oracle still saw the cycle.
		assert_eq!(*cycles.lock(), vec![1]);
	}

	#[test]
	fn unloads_dead_loaders_without_classes() {
		let (registry, loader) = setup();
		registry.load_class(loader, "test.Empty").unwrap();
		let idle = registry.new_loader("idle", vec![]);

		let coordinator = UnloadCoordinator::new(
			registry.clone(),
			ScriptedOracle {
				dead_loaders: live(&["app", "idle", "bootstrap"]),
				..Default::default()
			},
		);
		let report = coordinator.trigger().unwrap();

		let unloaded: Vec<LoaderId> = report
			.unloaded_loaders
			.iter()
			.map(|loader| loader.id())
			.collect();
		assert_eq!(unloaded, vec![loader, idle]);
		assert_eq!(report.statistics.loaders_unloaded, 2);
		assert!(registry.loader(registry.boot_loader()).is_some());
	}

	/// Blocks every cycle in `begin_cycle` until released.
	struct BlockingOracle {
		started: Sender<()>,
		release: crossbeam::channel::Receiver<()>,
		begun: Arc<Mutex<usize>>,
	}

	impl ReachabilityOracle for BlockingOracle {
		fn begin_cycle(&mut self, _snapshot: &RegistrySnapshot) -> Result<(), OracleError> {
			*self.begun.lock() += 1;
			let _ = self.started.send(());
			let _ = self.release.recv();
			Ok(())
		}

		fn query(&mut self, _query: &LivenessQuery<'_>) -> Result<Liveness, OracleError> {
			Ok(Liveness::DEAD)
		}
	}

	#[test]
	fn concurrent_triggers_coalesce() {
		let (registry, loader) = setup();
		registry.load_class(loader, "test.Empty").unwrap();

		let (started_sender, started) = bounded(4);
		let (release_sender, release) = bounded(0);
		let begun = Arc::new(Mutex::new(0));
		let coordinator = UnloadCoordinator::new(
			registry.clone(),
			BlockingOracle {
				started: started_sender,
				release,
				begun: begun.clone(),
			},
		);

		let (first, second) = thread::scope(|scope| {
			let first = scope.spawn(|| coordinator.trigger());
			started.recv().unwrap();
			assert_eq!(coordinator.phase(), UnloadPhase::Scanning);

			let second = scope.spawn(|| coordinator.trigger());
			while coordinator.coalesced_triggers() == 0 {
				thread::yield_now();
			}
			drop(release_sender);

			(first.join().unwrap(), second.join().unwrap())
		});

		let first = first.unwrap();
		let second = second.unwrap();
		assert_eq!(*begun.lock(), 1);
		assert!(!first.coalesced);
		assert!(second.coalesced);
		assert_eq!(first.cycle(), second.cycle());
		assert_eq!(second.unloaded_names(), vec!["test.Empty"]);
		assert_eq!(coordinator.cycles(), 1);
	}

	#[test]
	fn joined_trigger_keeps_its_own_cycle() {
		let (registry, loader) = setup();
		registry.load_class(loader, "test.Empty").unwrap();

		let (started_sender, started) = bounded(4);
		let (release_sender, release) = bounded(0);
		let coordinator = UnloadCoordinator::new(
			registry.clone(),
			BlockingOracle {
				started: started_sender,
				release,
				begun: Arc::new(Mutex::new(0)),
			},
		);

		let (first, joined, next) = thread::scope(|scope| {
			let first = scope.spawn(|| coordinator.trigger());
			started.recv().unwrap();
			let joined = scope.spawn(|| coordinator.trigger());
			while coordinator.coalesced_triggers() == 0 {
				thread::yield_now();
			}
			release_sender.send(()).unwrap();
			let first = first.join().unwrap();

			// A new cycle may complete before the joined trigger wakes up.
			let next = scope.spawn(|| coordinator.trigger());
			started.recv().unwrap();
			release_sender.send(()).unwrap();
			let next = next.join().unwrap();

			(first, joined.join().unwrap(), next)
		});

		let first = first.unwrap();
		let joined = joined.unwrap();
		let next = next.unwrap();
		assert_eq!(first.cycle(), 1);
		assert_eq!(joined.cycle(), 1);
		assert!(joined.coalesced);
		assert_eq!(joined.unloaded_names(), vec!["test.Empty"]);
		assert_eq!(next.cycle(), 2);
		assert!(next.unloaded.is_empty());
		assert!(coordinator.state.lock().joined.is_empty());
	}
}
