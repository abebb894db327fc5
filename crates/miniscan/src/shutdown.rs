use std::sync::Arc;

use miniscan_engine::ScanEngine;

/// First CTRL+C asks the engine to wind down gracefully: running scans
/// finish, queued rows stay PENDING and resumable. A second CTRL+C exits
/// immediately.
pub fn spawn_ctrl_c_handler(engine: Arc<ScanEngine>) {
    tokio::spawn(async move {
        let mut signals = 0u8;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            signals += 1;
            if signals == 1 {
                eprintln!(
                    "Stop requested — finishing in-flight scans (press CTRL+C again to exit immediately)."
                );
                engine.request_stop();
            } else {
                eprintln!("Stop requested again — exiting immediately; claimed commits stay resumable.");
                std::process::exit(130);
            }
        }
    });
}
