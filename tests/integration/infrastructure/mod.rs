pub mod process_harness;

pub use process_harness::{bin_dir, ProcessTestHarness, TestProcess};
pub use socket_framework::{InProcessService, SocketTestUtils};
