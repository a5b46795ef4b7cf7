pub mod env_var;
pub mod observability;

/// Name used for the log file and the binary
pub const APP_NAME: &str = "simnet";
