//! Resource management
//!
//! Mesh data, texture decoding and caching, OBJ model import and WGSL
//! program loading.

mod mesh;
mod model;
mod shader;
mod texture;

pub use mesh::*;
pub use model::*;
pub use shader::*;
pub use texture::*;
