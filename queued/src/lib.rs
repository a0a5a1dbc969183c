pub mod config;
pub mod err;
pub mod fs;
pub mod job;
pub mod lifecycle;
pub mod report;
pub mod runner;
pub mod source;
pub mod util;
pub mod worker;

#[cfg(test)]
mod test;
