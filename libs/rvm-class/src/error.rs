use crate::LoaderId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassError {
	#[error("Class {name} is already defined by {loader}")]
	DuplicateClass { name: String, loader: LoaderId },
	#[error("Component class {name} is not loaded")]
	ComponentNotLoaded { name: String },
	#[error("Array dimensions {dimensions} out of range (1..={max})")]
	InvalidDimensions { dimensions: u32, max: u8 },
	#[error("Class {name} could not be found by {loader}")]
	ClassNotFound { name: String, loader: LoaderId },
	#[error("Invalid class name {0:?}")]
	InvalidName(String),
	#[error("Unknown class loader {0}")]
	UnknownLoader(LoaderId),
	#[error("Class {name} has been unloaded")]
	ClassUnloaded { name: String },
	#[error("Class loader {0} is unloading")]
	LoaderUnloading(LoaderId),
}
