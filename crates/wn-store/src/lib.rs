pub mod writer;
pub mod versions;

pub use writer::*;
pub use versions::*;
