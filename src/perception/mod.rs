pub mod marks;
pub mod resize;
pub mod screenshot;
pub mod types;
