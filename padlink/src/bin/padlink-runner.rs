use std::error::Error;

use padlink::core::logging::init_logger;

/// Hosts one script session for a supervisor running in another process.
fn main() -> Result<(), Box<dyn Error>> {
    init_logger();

    let server_name = std::env::args()
        .nth(1)
        .ok_or("missing IPC bootstrap server name argument")?;

    padlink::sandbox::runner::run_child(server_name)
}
