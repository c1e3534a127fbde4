pub mod enums;
pub mod monitoring;
pub mod session;
pub mod vital_sign;

pub use enums::*;
pub use monitoring::*;
pub use session::*;
pub use vital_sign::*;
