pub mod errors;
pub mod token;
pub mod graph;
pub mod buffer;
pub mod blob;

pub use errors::*;
pub use token::*;
pub use graph::*;
pub use buffer::*;
pub use blob::*;
