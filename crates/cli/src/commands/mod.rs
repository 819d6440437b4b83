pub mod plugins;
pub mod process;
pub mod registry_helper;
