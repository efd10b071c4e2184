mod builder;
mod path_selection;

pub use builder::{BootstrapReport, CircuitBuilder};
pub use path_selection::{PathSelectionError, PathSelector, RelayPath, SelectionOptions};
