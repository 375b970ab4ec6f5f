//! Compiles personalized timeline scenes into a single ffmpeg filter-graph
//! render.

pub mod batch;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod media;
pub mod render;
pub mod resolve;
pub mod sandbox;
pub mod scene;
pub mod schema;
pub mod substitute;
pub mod text;

pub use error::{RenderError, RenderResult};
pub use render::{RenderJob, Renderer};
pub use scene::Scene;
pub use substitute::SubstitutionContext;
