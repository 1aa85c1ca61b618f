pub mod cfg;
pub mod relay;

pub use cfg::{NodeConfig, Overrides};
pub use relay::{broadcast, run_error_loop, run_inbound_loop};
