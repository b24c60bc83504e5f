pub mod error;
pub mod hash;
pub mod types;

pub use error::{GantryError, Result};
pub use hash::{ContentHash, HashedStream};
pub use types::{ByteRange, ByteStream, KeyContext, LocationDescriptor, ObjectLocator};
