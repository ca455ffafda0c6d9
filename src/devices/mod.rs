pub mod traits;
pub mod register_map;

pub use traits::RegisterBackend;
pub use register_map::{RegisterMap, RegisterPreset};
