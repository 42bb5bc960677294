mod array;
mod descriptor;
mod error;
mod loader;
mod registry;
mod source;

pub use descriptor::*;
pub use error::*;
pub use loader::*;
pub use registry::*;
pub use source::*;
