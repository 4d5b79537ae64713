pub mod args;
pub mod commands;

pub use args::CloudProbe;
pub use commands::run;
