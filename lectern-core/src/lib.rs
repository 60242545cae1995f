mod events;
mod notify;
mod util;

pub use events::*;
pub use notify::*;
pub use util::*;
