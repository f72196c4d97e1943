pub mod errors;
pub mod retry;
