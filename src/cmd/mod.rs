//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                   |
//! |-----------|----------------------------------------------------|
//! | `init`    | `Init`                                             |
//! | `run`     | `Engine`, `Dispatch`, `Discover`, `EnqueueOrg`     |
//! | `fleet`   | `Queue`, `Fleet`                                   |
//! | `config`  | `Config`                                           |

pub mod config;
pub mod fleet;
pub mod init;
pub mod run;

pub use config::cmd_config;
pub use fleet::{cmd_fleet, cmd_queue};
pub use init::cmd_init;
pub use run::{cmd_discover, cmd_dispatch, cmd_engine, cmd_enqueue_org};
