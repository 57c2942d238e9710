mod engine;
mod error;
mod facade;
mod path;
mod sled_backend;

pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
use path::expand_home_path;
pub use sled_backend::SledStorage;
