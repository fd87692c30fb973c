pub mod db;
pub mod models;
mod nodes;
pub mod quota;
mod tables;

pub use db::{Database, DatabaseError};
pub use tables::*;
