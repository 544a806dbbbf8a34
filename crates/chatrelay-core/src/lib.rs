pub mod config;
pub mod emitter;
pub mod error;
pub mod image_tool;
pub mod monitor;
pub mod orchestrator;
pub mod preset;
pub mod run_driver;
pub mod scratch;
pub mod session;
pub mod speech_tool;
pub mod tool;
pub mod toolbox;
pub mod web_fetch_tool;
pub mod web_search_tool;

pub use config::*;
pub use emitter::*;
pub use error::*;
pub use image_tool::*;
pub use monitor::*;
pub use orchestrator::*;
pub use preset::*;
pub use run_driver::*;
pub use scratch::*;
pub use session::*;
pub use speech_tool::*;
pub use tool::*;
pub use toolbox::*;
pub use web_fetch_tool::*;
pub use web_search_tool::*;
