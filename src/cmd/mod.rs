//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `runs`   | `Runs`           |
//! | `config` | `Config`         |

pub mod config;
pub mod run;
pub mod runs;

pub use config::cmd_config;
pub use run::cmd_run;
pub use runs::cmd_runs;
