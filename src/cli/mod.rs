mod args;
mod render;

pub use args::CliArgs;
pub use render::{render_json, render_text};
