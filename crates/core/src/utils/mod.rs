pub mod id_generator;
pub mod time;

pub use id_generator::*;
pub use time::*;
