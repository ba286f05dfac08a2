//! Adapter interfaces for external systems.
//!
//! Adapters put the programs and OS facilities the provisioner drives
//! behind narrow traits, so orchestration logic can be exercised with
//! fakes:
//! - `CommandRunner`: external processes
//! - `PackageManager`: winget / apt / Homebrew
//! - `Transport`: remote artifact transfer
//! - `AutostartRegistry`: logon-triggered start entries

pub mod autostart;
pub mod package;
pub mod process;
pub mod transport;

// Re-export the adapter seams
pub use autostart::{AutostartEntry, AutostartRegistry, Registration};
pub use package::PackageManager;
pub use process::{
    CommandRunner, Invocation, LineFilter, OutputMode, ProcessOutput, SystemRunner,
};
pub use transport::Transport;
