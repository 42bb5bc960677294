use ahash::{HashMap, HashMapExt};
use num_traits::{NumCast, PrimInt, ToPrimitive};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

/// Keyed, insertion-ordered table that hands out an [`Id`] per value.
///
/// Ids are never reused. Once a value is removed its id stays dead, so an entry
/// inserted later under the same key always receives a new identity.
///
/// `V` names the id space while `T` is what actually gets stored, so a table of `Arc<Class>` still
/// hands out `Id<Class>`.
pub struct Storage<K: Hash + Eq + Debug, V: StorageValue, T = V> {
	lookup: HashMap<K, Id<V>>,
	values: Vec<Option<(K, T)>>,
	len: usize,
}

impl<K: Hash + Eq + Debug + Clone, V: StorageValue, T> Storage<K, V, T> {
	pub fn new() -> Storage<K, V, T> {
		Storage {
			lookup: HashMap::new(),
			values: vec![],
			len: 0,
		}
	}

	/// Inserts a value under a fresh id. If the key is taken the existing id is returned as the error.
	pub fn try_insert(&mut self, key: K, value: T) -> Result<Id<V>, Id<V>> {
		if let Some(existing) = self.lookup.get(&key) {
			return Err(*existing);
		}

		let id = Id::new(self.values.len() + 1);
		self.lookup.insert(key.clone(), id);
		self.values.push(Some((key, value)));
		self.len += 1;
		Ok(id)
	}

	/// Allocates a fresh id for a value that is built from its own id.
	pub fn try_insert_with(
		&mut self,
		key: K,
		func: impl FnOnce(Id<V>) -> T,
	) -> Result<Id<V>, Id<V>> {
		if let Some(existing) = self.lookup.get(&key) {
			return Err(*existing);
		}

		let id = Id::new(self.values.len() + 1);
		self.lookup.insert(key.clone(), id);
		self.values.push(Some((key, func(id))));
		self.len += 1;
		Ok(id)
	}

	pub fn remove(&mut self, id: Id<V>) -> Option<T> {
		let slot = self.values.get_mut(id.index())?;
		let (key, value) = slot.take()?;
		self.lookup.remove(&key);
		self.len -= 1;
		Some(value)
	}

	pub fn contains(&self, key: &K) -> bool {
		self.lookup.contains_key(key)
	}

	pub fn contains_id(&self, id: Id<V>) -> bool {
		self.get(id).is_some()
	}

	pub fn get_id<Q: ?Sized>(&self, key: &Q) -> Option<Id<V>>
	where
		K: Borrow<Q>,
		Q: Hash + Eq,
	{
		self.lookup.get(key).copied()
	}

	pub fn get_keyed<Q: ?Sized>(&self, key: &Q) -> Option<&T>
	where
		K: Borrow<Q>,
		Q: Hash + Eq,
	{
		let id = self.get_id(key)?;
		self.get(id)
	}

	pub fn get(&self, id: Id<V>) -> Option<&T> {
		self.values
			.get(id.index())
			.and_then(|slot| slot.as_ref())
			.map(|(_, value)| value)
	}

	pub fn get_mut(&mut self, id: Id<V>) -> Option<&mut T> {
		self.values
			.get_mut(id.index())
			.and_then(|slot| slot.as_mut())
			.map(|(_, value)| value)
	}

	/// Live entries in ascending id (insertion) order.
	pub fn iter(&self) -> impl Iterator<Item = (Id<V>, &T)> + '_ {
		self.values.iter().enumerate().filter_map(|(idx, slot)| {
			slot.as_ref().map(|(_, value)| (Id::new(idx + 1), value))
		})
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

impl<K: Hash + Eq + Debug + Clone, V: StorageValue, T> Default for Storage<K, V, T> {
	fn default() -> Self {
		Self::new()
	}
}

pub struct Id<V: StorageValue>(V::Idx);

impl<V: StorageValue> Id<V> {
	/// Creates an id from its one-based position.
	pub fn new(idx: usize) -> Id<V> {
		Id(<V::Idx as NumCast>::from(idx).expect("Id space exhausted"))
	}

	pub fn idx(&self) -> V::Idx {
		self.0
	}

	fn index(&self) -> usize {
		self.0.to_usize().unwrap_or(0).wrapping_sub(1)
	}
}

impl<V: StorageValue> Clone for Id<V> {
	fn clone(&self) -> Self {
		*self
	}
}

impl<V: StorageValue> Copy for Id<V> {}

impl<V: StorageValue> Debug for Id<V> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}<{}>", V::NAME, self.0)
	}
}

impl<V: StorageValue> Display for Id<V> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}#{}", V::NAME, self.0)
	}
}

impl<V: StorageValue> PartialEq for Id<V> {
	fn eq(&self, other: &Self) -> bool {
		self.0.eq(&other.0)
	}
}

impl<V: StorageValue> Eq for Id<V> {}

impl<V: StorageValue> PartialOrd for Id<V> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl<V: StorageValue> Ord for Id<V> {
	fn cmp(&self, other: &Self) -> Ordering {
		self.0.cmp(&other.0)
	}
}

impl<V: StorageValue> Hash for Id<V> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.0.hash(state)
	}
}

pub trait StorageValue {
	type Idx: PrimInt + Hash + Display + Debug;
	const NAME: &'static str;
}
