pub mod instance_fabric;
