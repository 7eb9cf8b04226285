pub mod events;
pub mod handle;
pub(crate) mod machine;
pub mod state;

pub use events::CallCommand;
pub use handle::{CallEngine, CallHandle};
pub use state::{CallSnapshot, CallState};
