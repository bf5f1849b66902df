mod value;
mod header;

pub use value::Value;
pub use header::{Header, HeaderFlags, ObjectType, Shape};
