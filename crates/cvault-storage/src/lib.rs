//! cvault-storage: OpenDAL-backed object store for encrypted chunks

pub mod health;
pub mod objects;
pub mod operator;

pub use health::{check_health, is_healthy};
pub use objects::{chunk_key, ObjectStore};
pub use operator::{build_operator, memory_operator};
