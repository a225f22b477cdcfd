pub mod value;
pub mod stage;
pub mod space;
pub mod config;
pub mod trial;
pub mod presets;
pub mod errors;

pub use value::*;
pub use stage::*;
pub use space::*;
pub use config::*;
pub use trial::*;
pub use errors::*;
