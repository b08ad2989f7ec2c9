mod config;
mod parse;
mod serve;

pub use config::{check_config, init_config};
pub use parse::run_parse;
pub use serve::serve;
