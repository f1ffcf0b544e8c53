pub mod loader;
pub mod persister;
pub mod program;

pub use loader::Loader;
pub use persister::Persister;
pub use program::{Context, Program};
