//! Animation modules: source bundling, strict loading and frame evaluation.

pub mod bundle;
pub mod frame;
pub mod loader;
pub mod schema;
pub mod watch;

pub use bundle::{Bundle, BundleBuilder};
pub use frame::{AttributeValue, Element, FrameDescription, Node};
pub use loader::{AnimationModule, load_module_file, load_module_value};
pub use watch::{BuildEvent, BuildSequence, LoadedBuild, run_watch_loop};
