pub mod backoff;
pub mod config;
pub mod dock;
pub mod docker;
pub mod error;
pub mod gate;
pub mod hub;
pub mod mtp;
pub mod package;
pub mod seeker;
pub mod ship;

#[cfg(test)]
mod test_util;
