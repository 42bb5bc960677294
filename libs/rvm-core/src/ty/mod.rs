use std::fmt::{Display, Formatter, Write};

/// Highest dimensionality an array type may have.
pub const MAX_ARRAY_DIMENSIONS: u8 = 255;

/// A type in its binary-name form, as `Class.getName` would print it.
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum Type {
	Primitive(PrimitiveType),
	Object(ObjectType),
	Array(Box<ArrayType>),
}

impl Type {
	/// Parses a field descriptor such as `Ltest.Empty;`, `[I` or `[[Ltest.Empty;`.
	pub fn parse(desc: &str) -> Option<Type> {
		match Self::parse_len(desc)? {
			(ty, len) if len == desc.len() => Some(ty),
			_ => None,
		}
	}

	pub fn parse_len(desc: &str) -> Option<(Type, usize)> {
		match *desc.as_bytes().first()? {
			b'L' => ObjectType::parse_len(desc).map(|(ty, l)| (Type::Object(ty), l)),
			b'[' => ArrayType::parse_len(desc).map(|(ty, l)| (Type::Array(Box::new(ty)), l)),
			_ => PrimitiveType::parse(desc).map(|v| (Type::Primitive(v), 1)),
		}
	}

	/// Parses a binary class name. Array names use descriptor syntax, everything else is a plain name.
	pub fn parse_name(name: &str) -> Option<Type> {
		if name.is_empty() {
			return None;
		}

		if name.starts_with('[') {
			return Type::parse(name);
		}

		if let Some(primitive) = PrimitiveType::from_keyword(name) {
			return Some(Type::Primitive(primitive));
		}

		if name.contains(['[', ';', '/']) {
			return None;
		}

		Some(Type::Object(ObjectType::new(name)))
	}

	/// The binary name of this type (`test.Empty`, `[Ltest.Empty;`, `int`).
	pub fn name(&self) -> String {
		match self {
			Type::Primitive(primitive) => primitive.keyword().to_string(),
			Type::Object(object) => object.name.clone(),
			Type::Array(array) => array.to_string(),
		}
	}

	/// Wraps this type into an array type with the given number of extra dimensions.
	pub fn array_of(self, dimensions: u8) -> Type {
		let mut ty = self;
		for _ in 0..dimensions {
			ty = Type::Array(Box::new(ArrayType::new(ty)));
		}
		ty
	}

	pub fn dimensions(&self) -> u8 {
		match self {
			Type::Array(array) => array.dimensions(),
			_ => 0,
		}
	}

	pub fn is_array(&self) -> bool {
		matches!(self, Type::Array(_))
	}
}

impl Display for Type {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Type::Primitive(v) => v.fmt(f),
			Type::Object(v) => v.fmt(f),
			Type::Array(v) => v.fmt(f),
		}
	}
}

#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum PrimitiveType {
	Boolean,
	Byte,
	Short,
	Int,
	Long,
	Char,
	Float,
	Double,
}

impl PrimitiveType {
	pub fn parse(desc: &str) -> Option<PrimitiveType> {
		Some(match *desc.as_bytes().first()? {
			b'Z' => PrimitiveType::Boolean,
			b'B' => PrimitiveType::Byte,
			b'C' => PrimitiveType::Char,
			b'D' => PrimitiveType::Double,
			b'F' => PrimitiveType::Float,
			b'I' => PrimitiveType::Int,
			b'J' => PrimitiveType::Long,
			b'S' => PrimitiveType::Short,
			_ => {
				return None;
			}
		})
	}

	pub fn from_keyword(keyword: &str) -> Option<PrimitiveType> {
		Some(match keyword {
			"boolean" => PrimitiveType::Boolean,
			"byte" => PrimitiveType::Byte,
			"short" => PrimitiveType::Short,
			"int" => PrimitiveType::Int,
			"long" => PrimitiveType::Long,
			"char" => PrimitiveType::Char,
			"float" => PrimitiveType::Float,
			"double" => PrimitiveType::Double,
			_ => return None,
		})
	}

	pub fn char(&self) -> char {
		match self {
			PrimitiveType::Boolean => 'Z',
			PrimitiveType::Byte => 'B',
			PrimitiveType::Short => 'S',
			PrimitiveType::Int => 'I',
			PrimitiveType::Long => 'J',
			PrimitiveType::Char => 'C',
			PrimitiveType::Float => 'F',
			PrimitiveType::Double => 'D',
		}
	}

	pub fn keyword(&self) -> &'static str {
		match self {
			PrimitiveType::Boolean => "boolean",
			PrimitiveType::Byte => "byte",
			PrimitiveType::Short => "short",
			PrimitiveType::Int => "int",
			PrimitiveType::Long => "long",
			PrimitiveType::Char => "char",
			PrimitiveType::Float => "float",
			PrimitiveType::Double => "double",
		}
	}
}

impl Display for PrimitiveType {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_char(self.char())
	}
}

#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct ObjectType {
	/// Dotted binary name, `test.Empty`.
	pub name: String,
}

impl ObjectType {
	pub fn new(name: impl Into<String>) -> ObjectType {
		ObjectType { name: name.into() }
	}

	pub fn parse_len(string: &str) -> Option<(ObjectType, usize)> {
		if string.as_bytes().first() != Some(&b'L') {
			return None;
		}

		let end = string.find(';')?;
		if end < 2 {
			return None;
		}

		Some((
			ObjectType {
				name: string[1..end].replace('/', "."),
			},
			end + 1,
		))
	}

	/// The slash separated name used for class file paths, `test/Empty`.
	pub fn internal_name(&self) -> String {
		self.name.replace('.', "/")
	}
}

impl Display for ObjectType {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_char('L')?;
		f.write_str(&self.name)?;
		f.write_char(';')
	}
}

#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct ArrayType {
	component: Type,
}

impl ArrayType {
	pub fn new(component: Type) -> ArrayType {
		ArrayType { component }
	}

	pub fn parse_len(string: &str) -> Option<(ArrayType, usize)> {
		let bytes = string.as_bytes();
		if bytes.first() != Some(&b'[') {
			return None;
		}

		let (component, length) = Type::parse_len(&string[1..])?;
		if component.dimensions() >= MAX_ARRAY_DIMENSIONS {
			return None;
		}
		Some((ArrayType { component }, length + 1))
	}

	pub fn component(&self) -> &Type {
		&self.component
	}

	/// The innermost non-array type.
	pub fn element(&self) -> &Type {
		match &self.component {
			Type::Array(array) => array.element(),
			ty => ty,
		}
	}

	pub fn dimensions(&self) -> u8 {
		self.component.dimensions().saturating_add(1)
	}
}

impl Display for ArrayType {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_char('[')?;
		self.component.fmt(f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn array_names() {
		let empty = Type::Object(ObjectType::new("test.Empty"));
		assert_eq!(empty.name(), "test.Empty");

		let array = empty.clone().array_of(1);
		assert_eq!(array.name(), "[Ltest.Empty;");
		assert_eq!(array.dimensions(), 1);

		let matrix = empty.array_of(2);
		assert_eq!(matrix.name(), "[[Ltest.Empty;");
		assert_eq!(matrix.dimensions(), 2);
	}

	#[test]
	fn parse_names() {
		assert_eq!(
			Type::parse_name("test.Empty"),
			Some(Type::Object(ObjectType::new("test.Empty")))
		);
		assert_eq!(
			Type::parse_name("[Ltest.Empty;"),
			Some(Type::Object(ObjectType::new("test.Empty")).array_of(1))
		);
		assert_eq!(
			Type::parse_name("[[I"),
			Some(Type::Primitive(PrimitiveType::Int).array_of(2))
		);
		assert_eq!(Type::parse_name("int"), Some(Type::Primitive(PrimitiveType::Int)));
		assert_eq!(Type::parse_name(""), None);
		assert_eq!(Type::parse_name("[Ltest.Empty"), None);
		assert_eq!(Type::parse_name("[Ltest.Empty;x"), None);
		assert_eq!(Type::parse_name("test/Empty"), None);
	}

	#[test]
	fn element_of_nested_array() {
		let Some(Type::Array(array)) = Type::parse_name("[[[Ltest.Empty;") else {
			panic!("not an array");
		};
		assert_eq!(array.dimensions(), 3);
		assert_eq!(array.element(), &Type::Object(ObjectType::new("test.Empty")));
		assert_eq!(array.component().name(), "[[Ltest.Empty;");
	}

	#[test]
	fn internal_name_uses_slashes() {
		assert_eq!(ObjectType::new("test.Empty").internal_name(), "test/Empty");
		assert_eq!(
			ObjectType::parse_len("Ltest/Empty;"),
			Some((ObjectType::new("test.Empty"), 12))
		);
	}
}
