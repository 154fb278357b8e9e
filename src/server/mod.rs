mod console;
mod daemon;
mod master;

pub use daemon::{Agent, Daemon};
