pub mod address;
pub mod amount;
pub mod notification;
pub mod payment;
pub mod response;

pub use address::*;
pub use amount::*;
pub use notification::*;
pub use payment::*;
pub use response::*;
