pub mod constants;
pub mod error;
pub mod frame;
pub mod message;

pub use constants::*;
pub use error::ProtocolError;
pub use frame::{read_frame, write_frame};
pub use message::{Request, Response};
