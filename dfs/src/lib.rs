mod dfs;
mod handle;

pub use dfs::*;
pub use handle::*;

#[macro_use]
extern crate log;
