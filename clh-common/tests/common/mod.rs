//! Shared helpers for clh-common integration tests.
#![allow(dead_code)]

pub mod fixtures;
pub mod mock;

pub use fixtures::{TestSandbox, write_script};
pub use mock::{free_port, serve};

// The crate denies unsafe code; ctor's constructor registration needs it.
#[allow(unsafe_code)]
mod init {
    #[ctor::ctor]
    fn init_logging() {
        clh_common::logging::init_test_logging();
    }
}
