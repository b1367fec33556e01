pub mod distil;
pub mod pull;
