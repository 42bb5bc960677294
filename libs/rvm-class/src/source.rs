use ahash::AHashMap;
use eyre::Context;
use parking_lot::Mutex;
use rvm_core::ObjectType;
use std::fs::read;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use zip::ZipArchive;

/// Where a loader finds the bytes of a class. Bytes are only carried around, never parsed.
pub trait ClassSource: Send + Sync {
	fn try_load(&self, ty: &ObjectType) -> eyre::Result<Option<Vec<u8>>>;
}

impl<S: ClassSource> ClassSource for Arc<S> {
	fn try_load(&self, ty: &ObjectType) -> eyre::Result<Option<Vec<u8>>> {
		(**self).try_load(ty)
	}
}

#[derive(Default)]
pub struct MemoryClassSource {
	classes: AHashMap<String, Vec<u8>>,
}

impl MemoryClassSource {
	pub fn new() -> MemoryClassSource {
		MemoryClassSource::default()
	}

	pub fn with(mut self, name: impl Into<String>, data: Vec<u8>) -> MemoryClassSource {
		self.insert(name, data);
		self
	}

	pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
		self.classes.insert(name.into(), data);
	}
}

impl ClassSource for MemoryClassSource {
	fn try_load(&self, ty: &ObjectType) -> eyre::Result<Option<Vec<u8>>> {
		Ok(self.classes.get(&ty.name).cloned())
	}
}

pub struct DirectoryClassSource {
	dir: PathBuf,
}

impl DirectoryClassSource {
	pub fn new(dir: PathBuf) -> DirectoryClassSource {
		DirectoryClassSource { dir }
	}
}

impl ClassSource for DirectoryClassSource {
	fn try_load(&self, ty: &ObjectType) -> eyre::Result<Option<Vec<u8>>> {
		let mut path = self.dir.join(PathBuf::from(ty.internal_name()));
		path.set_extension("class");

		if path.exists() {
			let vec = read(&path).wrap_err_with(|| format!("Reading {}", path.display()))?;
			return Ok(Some(vec));
		}

		Ok(None)
	}
}

pub struct JarClassSource {
	file_lookup: AHashMap<String, usize>,
	archive: Mutex<ZipArchive<Cursor<Vec<u8>>>>,
}

impl JarClassSource {
	pub fn new(data: Vec<u8>) -> eyre::Result<JarClassSource> {
		let reader = Cursor::new(data);
		let mut archive = ZipArchive::new(reader).wrap_err("Failed to open jar")?;
		let mut file_lookup = AHashMap::new();
		for index in 0..archive.len() {
			let file = archive.by_index(index)?;
			let file_name = file.name();
			if file.is_file() && file_name.ends_with(".class") {
				file_lookup.insert(file_name.trim_end_matches(".class").to_string(), index);
			}
		}

		Ok(JarClassSource {
			file_lookup,
			archive: Mutex::new(archive),
		})
	}
}

impl ClassSource for JarClassSource {
	fn try_load(&self, ty: &ObjectType) -> eyre::Result<Option<Vec<u8>>> {
		if let Some(file_location) = self.file_lookup.get(&ty.internal_name()) {
			let mut guard = self.archive.lock();
			let mut file = guard.by_index(*file_location)?;

			let mut data = Vec::with_capacity(file.size() as usize);
			file.read_to_end(&mut data)?;
			return Ok(Some(data));
		}

		Ok(None)
	}
}
