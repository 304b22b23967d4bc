pub mod network;
pub mod pipeline;
pub mod responses;
pub mod rio;
pub mod server;
pub mod server_internals;
pub mod uring;
pub mod utils;
