mod deserialize;
pub mod path_security;
pub mod tar;

pub use deserialize::*;

/// A short random id to tell jobs apart in logs.
pub fn short_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}
