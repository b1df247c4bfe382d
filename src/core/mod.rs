pub mod error;
pub mod monitor;
pub mod output;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod utils;
pub mod write;
