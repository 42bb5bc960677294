use std::sync::Arc;

use rvm_class::MemoryClassSource;
use rvm_runtime::{JavaLoader, Runtime, RuntimeConfig};
use tracing::info;


pub const EMPTY: &str = "test.Empty";
pub const EMPTY_ARRAY: &str = "[Ltest.Empty;";

/// Stand-in class file bytes. Nothing parses them, only their length is recorded.
pub fn class_bytes(name: &str) -> Vec<u8> {
	let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x00, 0x00, 0x34];
	bytes.extend_from_slice(name.as_bytes());
	bytes
}

/// A source with `test.Empty` and whatever extra classes are asked for.
pub fn test_classes(extra: &[&str]) -> MemoryClassSource {
	let mut source = MemoryClassSource::new().with(EMPTY, class_bytes(EMPTY));
	for name in extra {
		source.insert(*name, class_bytes(name));
	}
	source
}

pub fn launch(config: RuntimeConfig) -> Arc<Runtime> {
	rvm_core::init();
	let boot = MemoryClassSource::new().with("java.lang.Object", class_bytes("java.lang.Object"));
	let runtime = Arc::new(Runtime::new(config, vec![Box::new(boot)]));
	info!("Launched test runtime");
	runtime
}

pub fn class_loader(runtime: &Runtime, name: &str, extra: &[&str]) -> eyre::Result<JavaLoader> {
	runtime.new_class_loader(name, vec![Box::new(test_classes(extra))])
}
