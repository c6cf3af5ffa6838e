pub mod bootstrap;
pub mod machine;
pub mod manifest;
