//! Runtime value representation and the serialization capability trait.

mod serializable;
mod value;

pub use serializable::Serializable;
pub use value::Value;
