use std::path::PathBuf;

use clap::Parser;
use eyre::{bail, Context};
use rvm_class::{ClassSource, DirectoryClassSource, JarClassSource, MemoryClassSource};
use rvm_runtime::{Runtime, RuntimeConfig};
use time::macros::format_description;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Loads a class through a fresh loader, keeps one array of it alive, and checks that the class
/// and its array class are unloaded only once the array is gone.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
	/// Binary name of the component class.
	#[arg(default_value = "test.Empty")]
	class: String,
	/// Directory or jar to load the class from. Without one an empty stand-in class is used.
	#[arg(short, long, value_name = "PATH")]
	classpath: Option<PathBuf>,
	#[arg(short, long, default_value_t = 10)]
	length: u32,
	#[arg(long, default_value_t = RuntimeConfig::DEFAULT_HEAP_SIZE)]
	heap_size: usize,
	#[arg(long)]
	no_class_unloading: bool,
}

fn main() -> eyre::Result<()> {
	let args = Args::parse();

	let timer = UtcTime::new(format_description!(
		"[hour]:[minute]:[second].[subsecond digits:3]"
	));
	let format = tracing_subscriber::fmt::format().with_timer(timer).compact();
	let fmt_layer = tracing_subscriber::fmt::layer().event_format(format);
	let filter = std::env::var(rvm_core::LOG_ENV)
		.ok()
		.and_then(|value| value.parse().ok())
		.unwrap_or_else(rvm_core::default_targets);
	tracing_subscriber::registry()
		.with(fmt_layer)
		.with(filter)
		.init();

	let runtime = Runtime::new(
		RuntimeConfig {
			heap_size: args.heap_size,
			class_unloading: !args.no_class_unloading,
			..RuntimeConfig::default()
		},
		vec![],
	);
	let events = runtime.subscribe_unload_events();
	let array_name = format!("[L{};", args.class);

	let loader = runtime.new_class_loader("unload", vec![source(&args)?])?;
	let class = runtime.load_class(loader.id, &args.class)?;
	let array = runtime.new_array_instance(&class.descriptor, args.length)?;
	check(&runtime, &args.class, true)?;
	check(&runtime, &array_name, true)?;

	drop((loader, class));
	runtime.trigger_full_collection()?;
	check(&runtime, &args.class, true)?;
	check(&runtime, &array_name, true)?;

	drop(array);
	let report = runtime.trigger_full_collection()?;
	let unloading = !args.no_class_unloading;
	check(&runtime, &args.class, !unloading)?;
	check(&runtime, &array_name, !unloading)?;

	for event in events.try_iter() {
		info!("Unloaded {} ({}) in cycle {}", event.name, event.kind, event.cycle);
	}
	info!(
		"Cycle {} unloaded {} classes, {} array classes, {} loaders",
		report.cycle(),
		report.statistics.classes_unloaded,
		report.statistics.array_classes_unloaded,
		report.statistics.loaders_unloaded
	);
	if !unloading {
		warn!("Class unloading is disabled, classes stay loaded");
	}
	Ok(())
}

fn source(args: &Args) -> eyre::Result<Box<dyn ClassSource>> {
	let Some(path) = &args.classpath else {
		let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE];
		bytes.extend_from_slice(args.class.as_bytes());
		return Ok(Box::new(MemoryClassSource::new().with(args.class.clone(), bytes)));
	};

	if path.extension().is_some_and(|extension| extension == "jar") {
		let data = std::fs::read(path).wrap_err_with(|| format!("Reading {}", path.display()))?;
		Ok(Box::new(JarClassSource::new(data)?))
	} else {
		Ok(Box::new(DirectoryClassSource::new(path.clone())))
	}
}

fn check(runtime: &Runtime, name: &str, expected: bool) -> eyre::Result<()> {
	let alive = runtime.is_class_alive(name);
	if alive != expected {
		bail!(
			"{name} is {} but should be {}",
			if alive { "alive" } else { "unloaded" },
			if expected { "alive" } else { "unloaded" }
		);
	}
	info!("{name} is {}", if alive { "alive" } else { "unloaded" });
	Ok(())
}
