pub mod health;
pub mod registry;
