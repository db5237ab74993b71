pub mod checksum;
pub mod crypto;
pub mod sql;
