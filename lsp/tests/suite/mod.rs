#[cfg(unix)]
mod process;
mod transport;
