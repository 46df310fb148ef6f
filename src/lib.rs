pub mod profile;
pub mod ssh_config;
#[cfg(unix)]
pub mod supervisor;
pub mod switcher;
