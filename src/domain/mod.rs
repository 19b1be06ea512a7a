pub mod effects;
pub mod frame_buffer;
pub mod models;
pub mod settings;
