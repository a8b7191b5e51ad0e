pub mod collection;
pub mod instance;
pub mod orchestrator;
pub mod outputs;
