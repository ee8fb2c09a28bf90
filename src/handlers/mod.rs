mod main_handlers;
pub use main_handlers::*;

mod rest;
pub use rest::*;

mod rpc;
pub use rpc::*;
