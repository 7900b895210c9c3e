pub mod constants;
pub mod coordinates;
pub mod filename;
pub mod progress;

pub use constants::*;
pub use coordinates::{latlon_scalar, nearest_index, regular_grid, round_coordinate};
pub use filename::{expand_date_template, expand_wildcard, generate_default_output_filename};
pub use progress::ProgressReporter;
