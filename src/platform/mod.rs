pub mod command;
pub mod common;
pub mod facts;
pub mod identity;
