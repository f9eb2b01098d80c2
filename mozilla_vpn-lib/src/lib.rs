pub mod command;
pub mod config;
pub mod dirs;
pub mod interface_config;
pub mod ip_address;
pub mod log_output;
pub mod logging;
pub mod settings;
pub mod shell_command_ext;
pub mod socket;
