pub mod attempt;
pub mod backend;

pub use attempt::*;
pub use backend::*;
