pub mod health;
pub mod diagnostics;
pub mod room_export;

pub use health::*;
pub use diagnostics::*;
pub use room_export::*;
