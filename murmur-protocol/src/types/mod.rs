pub mod event;
pub mod room;
pub mod section;
pub mod session;

pub use event::*;
pub use room::*;
pub use section::*;
pub use session::*;
