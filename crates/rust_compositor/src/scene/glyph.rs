//! Hand-off point for laid-out text
//!
//! Text shaping happens elsewhere; it produces one [`GlyphPlacement`] per
//! glyph with the glyph's bitmap already uploaded as a texture. A run of
//! placements becomes a run of views pushed onto a layer.

use super::graph::{NodeId, SceneError, SceneGraph};
use crate::render::TextureId;

/// One positioned glyph bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlyphPlacement {
    /// Left edge relative to the layer
    pub x: i32,
    /// Top edge relative to the layer
    pub y: i32,
    /// Bitmap width in pixels
    pub width: u32,
    /// Bitmap height in pixels
    pub height: u32,
    /// Coverage texture, `None` for blank glyphs such as spaces
    pub texture: Option<TextureId>,
}

impl SceneGraph {
    /// Append one view per glyph to `layer`, in order
    ///
    /// Blank glyphs with a zero-sized bitmap are skipped. Returns the created
    /// views so the caller can remove them when the text changes.
    pub fn push_glyph_run(
        &mut self,
        layer: NodeId,
        glyphs: &[GlyphPlacement],
    ) -> Result<Vec<NodeId>, SceneError> {
        if !self.is_layer(layer)? {
            return Err(SceneError::NotALayer(layer));
        }

        let mut views = Vec::with_capacity(glyphs.len());
        for glyph in glyphs.iter().filter(|g| g.width > 0 && g.height > 0) {
            let view = self.create_view(glyph.width, glyph.height);
            self.set_view_texture(view, glyph.texture)?;
            self.set_position(view, glyph.x, glyph.y)?;
            self.push(layer, view)?;
            views.push(view);
        }

        log::trace!("Pushed glyph run of {} views", views.len());
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyph(x: i32, width: u32) -> GlyphPlacement {
        GlyphPlacement {
            x,
            y: 4,
            width,
            height: 12,
            texture: None,
        }
    }

    #[test]
    fn test_glyph_run_appends_in_order() {
        let mut graph = SceneGraph::new();
        let scene = graph.create_scene();
        let line = graph.create_layer();
        graph.set_root(scene, line).unwrap();

        let views = graph
            .push_glyph_run(line, &[glyph(0, 7), glyph(7, 0), glyph(14, 6)])
            .unwrap();

        assert_eq!(views.len(), 2);
        assert_eq!(graph.children(line).unwrap(), views.as_slice());
        assert_eq!(graph.position(views[1]).unwrap(), (14, 4));
        assert_eq!(graph.get_vertex_index_sizes(scene).unwrap().views, 2);
    }

    #[test]
    fn test_glyph_run_needs_layer() {
        let mut graph = SceneGraph::new();
        let view = graph.create_view(1, 1);
        assert_eq!(
            graph.push_glyph_run(view, &[glyph(0, 1)]),
            Err(SceneError::NotALayer(view))
        );
    }
}
