use rvm_core::MAX_ARRAY_DIMENSIONS;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
	/// Capacity of the object heap in bytes.
	pub heap_size: usize,
	/// When disabled, collections still free heap objects but class metadata is never unloaded.
	pub class_unloading: bool,
	pub max_array_dimensions: u8,
	/// Run one full collection before reporting an allocation as out of heap.
	pub retry_allocation: bool,
}

impl RuntimeConfig {
	pub const DEFAULT_HEAP_SIZE: usize = 1024 * 1024;
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			heap_size: Self::DEFAULT_HEAP_SIZE,
			class_unloading: true,
			max_array_dimensions: MAX_ARRAY_DIMENSIONS,
			retry_allocation: true,
		}
	}
}
