pub mod args;
pub mod commands;

pub use args::{Cli, Commands, Grouping};
pub use commands::run;
