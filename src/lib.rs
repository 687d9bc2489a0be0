#[macro_use]
pub mod control_types_macro;

pub mod action;
pub mod common;
pub mod conditioning;
pub mod config;
pub mod control_state;
pub mod device;
pub mod driver;
pub mod host;
pub mod input;
pub mod mapping;
pub mod mode;
pub mod schemas;
pub mod sim;
