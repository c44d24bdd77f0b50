pub mod command_buffer;
pub mod command_encoder;
pub mod command_list;
pub mod command_queue;
pub mod encoder_bindings;
pub mod fence;
pub mod gpu_command;
pub mod render_pass_desc;
