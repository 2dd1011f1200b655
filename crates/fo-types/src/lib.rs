pub mod trial;
pub mod pool;
pub mod advisory;
pub mod errors;

pub use trial::*;
pub use pool::*;
pub use advisory::*;
pub use errors::*;
