mod storage;
mod ty;

use std::sync::Once;
pub use storage::*;
use tracing::Level;
use tracing_subscriber::filter;
use tracing_subscriber::layer::SubscriberExt;
pub use ty::*;

/// Environment variable holding a `Targets` filter, e.g. `info,class_unload=debug`.
pub const LOG_ENV: &str = "RVM_LOG";

static START: Once = Once::new();

pub fn init() {
	START.call_once(|| {
		let filter = std::env::var(LOG_ENV)
			.ok()
			.and_then(|value| value.parse::<filter::Targets>().ok())
			.unwrap_or_else(default_targets);
		let layered = tracing_subscriber::registry()
			.with(tracing_subscriber::fmt::layer())
			.with(filter);

		// Somebody else (a test harness, the binary) may already own the global subscriber.
		let _ = tracing::subscriber::set_global_default(layered);
	});
}

pub fn default_targets() -> filter::Targets {
	filter::Targets::new()
		.with_default(Level::DEBUG)
		.with_target("gc", Level::INFO)
		.with_target("class_unload", Level::DEBUG)
}
