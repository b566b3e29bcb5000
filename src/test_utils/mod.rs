//! Helpers shared by unit tests and, through the `test-util` feature, by the
//! integration tests under `tests/`.

pub mod harness;
pub mod mock_ingestion;
pub mod recording_listener;

use std::thread;
use std::time::{Duration, Instant};

pub use harness::TestPipeline;
pub use mock_ingestion::MockIngestion;
pub use recording_listener::RecordingListener;

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
