//! Wayfarer.
//!
//! Resolves media assets of the travel diary through the same cache tiers the client uses, and
//! maintains the persistent caches on disk.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
