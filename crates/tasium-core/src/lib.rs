pub mod controller;
pub mod error;
pub mod memory;
pub mod movie;
