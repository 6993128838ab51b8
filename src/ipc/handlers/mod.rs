pub mod core;
pub mod imports;
