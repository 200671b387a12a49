pub mod client;
pub mod decision;
pub mod manifest;
pub mod pipeline;
pub mod service;
pub mod session;
pub mod source;
