//! Small OS helpers shared by the pool and the helper binary.

mod process;

pub use process::is_process_alive;
