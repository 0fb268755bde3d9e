pub mod io;
pub mod shutdown;
