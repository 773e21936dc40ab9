//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `run`      | `Run`            |
//! | `validate` | `Validate`       |
//! | `config`   | `Config`         |

pub mod config;
pub mod run;
pub mod validate;

pub use config::cmd_config;
pub use run::{RunOptions, cmd_run};
pub use validate::cmd_validate;
