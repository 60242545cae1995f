mod id;
mod sequence;

pub use id::*;
pub use sequence::*;
