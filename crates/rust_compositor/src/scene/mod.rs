//! Retained scene graph of layers and textured views
//!
//! A [`SceneGraph`] is an arena holding every node and scene. Layers group
//! children in paint order (first child is painted first, underneath its
//! later siblings); views are leaf rectangles that reference a texture.
//! Traversal flattens a scene into one quad per view.

mod geometry;
mod glyph;
mod graph;

pub use geometry::{GeometrySize, QuadVertex, SceneGeometry, INDICES_PER_VIEW, VERTICES_PER_VIEW};
pub use glyph::GlyphPlacement;
pub use graph::{NodeId, SceneError, SceneGraph, SceneId, View};
