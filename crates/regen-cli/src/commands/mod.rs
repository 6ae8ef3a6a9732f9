pub mod build;
pub mod layers;
