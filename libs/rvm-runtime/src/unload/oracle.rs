use crate::unload::CycleReport;
use rvm_class::{ClassDescriptor, LoaderData, RegistrySnapshot};
use std::sync::Arc;
use thiserror::Error;

/// Answers reachability questions for one collection cycle at a time.
///
/// The coordinator calls [`ReachabilityOracle::begin_cycle`] once with the snapshot it is going to
/// decide on, then queries every descriptor of that snapshot, and finally reports the outcome of a
/// completed cycle through [`ReachabilityOracle::end_cycle`]. Cycles that fail never see
/// `end_cycle`.
pub trait ReachabilityOracle: Send {
	fn begin_cycle(&mut self, snapshot: &RegistrySnapshot) -> Result<(), OracleError>;

	fn query(&mut self, query: &LivenessQuery<'_>) -> Result<Liveness, OracleError>;

	/// Whether a loader's holder is still reachable. Loaders the oracle reports dead are unloaded
	/// once they no longer define any class.
	fn query_loader(&mut self, _loader: &LoaderData) -> Result<bool, OracleError> {
		Ok(true)
	}

	fn end_cycle(&mut self, _report: &CycleReport) {}
}

pub struct LivenessQuery<'a> {
	pub class: &'a Arc<ClassDescriptor>,
	/// The defining loader, absent when the snapshot no longer lists it.
	pub loader: Option<&'a Arc<LoaderData>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Liveness {
	/// Some instance of the class is reachable.
	pub instances_reachable: bool,
	/// A reachable object or a live class refers to the class as metadata.
	pub referenced_as_metadata: bool,
	/// The defining loader is reachable and not unloading.
	pub loader_alive: bool,
}

impl Liveness {
	pub const DEAD: Liveness = Liveness {
		instances_reachable: false,
		referenced_as_metadata: false,
		loader_alive: false,
	};

	pub fn is_live(&self) -> bool {
		self.instances_reachable || self.referenced_as_metadata || self.loader_alive
	}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
	#[error("Reachability is unavailable: {0}")]
	Unavailable(String),
	#[error("{0} was not part of the prepared snapshot")]
	UnknownClass(String),
}
