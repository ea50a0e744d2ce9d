//! Planet with an instanced asteroid ring
//!
//! Run with:
//!   cargo run --release
//!
//! Controls:
//!   WASD         - Move camera
//!   Space / Ctrl - Move up/down
//!   Mouse        - Look around
//!   Scroll       - Move along the view direction
//!   Escape       - Exit

use asteroid_field::{app, AppConfig};

fn main() {
    env_logger::init();

    if let Err(e) = app::run(AppConfig::default()) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
