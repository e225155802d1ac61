pub mod constants;
pub mod string_utils;
pub mod time_utils;

pub use constants::*;
pub use string_utils::{decode_resource_name, encode_resource_name, fanout_path, resource_file_name};
pub use time_utils::now_ms;
