use std::time::Duration;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UnloadStatistics {
	pub cycle: u64,
	pub classes_scanned: usize,
	/// Ordinary classes evicted.
	pub classes_unloaded: usize,
	pub array_classes_unloaded: usize,
	pub loaders_unloaded: usize,
	pub duration: Duration,
}

impl UnloadStatistics {
	pub fn total_unloaded(&self) -> usize {
		self.classes_unloaded + self.array_classes_unloaded
	}
}
