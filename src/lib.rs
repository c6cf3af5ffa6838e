pub mod cloudinit;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod hypervisor;
pub mod machine;
pub mod repository;
pub mod resources;
pub mod utils;
