//! Supervisor entry point: starts the interceptor and analyzer processes
//! and waits for either to exit or for Ctrl-C, per spec.md §2's two-process
//! architecture and §6's exit code table.

use netshield::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    netshield::init_logging("netshield=info");

    let supervisor = match Supervisor::spawn() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("netshield: failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.run_until_shutdown().await {
        eprintln!("netshield: {e}");
        std::process::exit(1);
    }
}
