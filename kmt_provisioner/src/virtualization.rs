pub mod domain;
pub mod identity;
pub mod lease;
pub mod network;
pub mod subnet;
pub mod templates;
