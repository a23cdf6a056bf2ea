#[cfg(unix)]
pub mod file;
pub mod mem;
