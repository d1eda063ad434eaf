pub mod config;
pub mod console;
pub mod dispatcher;
pub mod fleet;
pub mod protocol;
pub mod recording;
pub mod relay;
pub mod util;
pub mod wind;
