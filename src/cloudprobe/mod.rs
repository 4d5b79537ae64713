pub mod cli;
pub mod config;
pub mod coordinator;
pub mod gc;
pub mod logger;
pub mod naming;
pub mod observability;
pub mod openstack;
pub mod probe;
pub mod server;
pub mod ssh;
pub mod test_support;
pub mod util;
