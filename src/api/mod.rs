pub mod commands;
pub mod content;
pub mod device_channel;
pub mod device_link;
pub mod devices;
pub mod fleet;
pub mod ws_handler;
