mod common;
#[cfg(unix)]
mod run_tests;
