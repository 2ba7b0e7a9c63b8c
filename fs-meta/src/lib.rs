mod meta_store;
mod path;

pub use meta_store::*;
pub use path::*;

#[macro_use]
extern crate log;
