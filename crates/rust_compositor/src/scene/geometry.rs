//! Flattening a scene into vertex and index data
//!
//! Every view becomes one quad: four [`QuadVertex`] corners in the order
//! top-left, top-right, bottom-right, bottom-left and six 16-bit indices
//! forming the triangles (0, 1, 2) and (0, 2, 3).

use super::graph::{SceneError, SceneGraph, SceneId};
use crate::render::TextureId;
use bytemuck::{Pod, Zeroable};

/// Vertices emitted for each view
pub const VERTICES_PER_VIEW: usize = 4;
/// Indices emitted for each view
pub const INDICES_PER_VIEW: usize = 6;

const QUAD_INDICES: [u16; INDICES_PER_VIEW] = [0, 1, 2, 0, 2, 3];
const QUAD_TEX_COORDS: [[f32; 2]; VERTICES_PER_VIEW] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

/// Interleaved `[x, y, u, v]` vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    /// Absolute position in pixels
    pub position: [f32; 2],
    /// Normalized texture coordinate
    pub tex_coord: [f32; 2],
}

/// Exact buffer lengths needed for a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeometrySize {
    /// Views reachable from the root
    pub views: usize,
}

impl GeometrySize {
    /// Number of vertices
    pub const fn vertices(self) -> usize {
        self.views * VERTICES_PER_VIEW
    }

    /// Number of indices
    pub const fn indices(self) -> usize {
        self.views * INDICES_PER_VIEW
    }

    /// Size of the vertex data in bytes
    pub const fn vertex_bytes(self) -> usize {
        self.vertices() * std::mem::size_of::<QuadVertex>()
    }

    /// Size of the index data in bytes
    pub const fn index_bytes(self) -> usize {
        self.indices() * std::mem::size_of::<u16>()
    }
}

/// Owned output of [`SceneGraph::traverse_and_emit`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneGeometry {
    /// Four vertices per view, in paint order
    pub vertices: Vec<QuadVertex>,
    /// Six indices per view
    pub indices: Vec<u16>,
    /// Texture of each view, in the same order
    pub textures: Vec<Option<TextureId>>,
}

impl SceneGeometry {
    /// Number of views drawn
    pub fn view_count(&self) -> usize {
        self.textures.len()
    }
}

impl SceneGraph {
    /// Exact vertex and index counts for a scene, from the cached view count
    pub fn get_vertex_index_sizes(&self, scene: SceneId) -> Result<GeometrySize, SceneError> {
        let views = match self.root(scene)? {
            Some(root) => self.descendant_views(root)?,
            None => 0,
        };

        if views * VERTICES_PER_VIEW > usize::from(u16::MAX) + 1 {
            return Err(SceneError::TooManyViews { views });
        }
        Ok(GeometrySize { views })
    }

    /// Fill caller-provided buffers with the scene's quads
    ///
    /// # Panics
    ///
    /// Panics if the slices do not have exactly the lengths reported by
    /// [`get_vertex_index_sizes`](Self::get_vertex_index_sizes), or if the
    /// traversal produces a different number of views than the cache claims.
    pub fn get_vertex_index_data(
        &self,
        scene: SceneId,
        vertices: &mut [QuadVertex],
        indices: &mut [u16],
    ) -> Result<(), SceneError> {
        let size = self.get_vertex_index_sizes(scene)?;
        assert_eq!(vertices.len(), size.vertices(), "vertex buffer length mismatch");
        assert_eq!(indices.len(), size.indices(), "index buffer length mismatch");

        let mut emitted = 0;
        self.for_each_view(scene, |_, view, (x, y)| {
            assert!(emitted < size.views, "scene emitted more views than counted");

            let (left, top) = (x as f32, y as f32);
            let (right, bottom) = (left + view.width as f32, top + view.height as f32);
            let corners = [[left, top], [right, top], [right, bottom], [left, bottom]];

            let first_vertex = emitted * VERTICES_PER_VIEW;
            for (slot, (position, tex_coord)) in vertices[first_vertex..first_vertex + VERTICES_PER_VIEW]
                .iter_mut()
                .zip(corners.into_iter().zip(QUAD_TEX_COORDS))
            {
                *slot = QuadVertex { position, tex_coord };
            }

            // Bounded by the TooManyViews check above
            let base = first_vertex as u16;
            let first_index = emitted * INDICES_PER_VIEW;
            for (slot, offset) in indices[first_index..first_index + INDICES_PER_VIEW]
                .iter_mut()
                .zip(QUAD_INDICES)
            {
                *slot = base + offset;
            }

            emitted += 1;
        })?;

        assert_eq!(emitted, size.views, "scene emitted fewer views than counted");
        Ok(())
    }

    /// Pre-order traversal producing one quad per view
    pub fn traverse_and_emit(&self, scene: SceneId) -> Result<SceneGeometry, SceneError> {
        let size = self.get_vertex_index_sizes(scene)?;
        let mut geometry = SceneGeometry {
            vertices: vec![QuadVertex::zeroed(); size.vertices()],
            indices: vec![0; size.indices()],
            textures: Vec::with_capacity(size.views),
        };

        self.get_vertex_index_data(scene, &mut geometry.vertices, &mut geometry.indices)?;
        self.for_each_view(scene, |_, view, _| geometry.textures.push(view.texture))?;
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::NodeId;
    use approx::assert_relative_eq;

    fn three_view_scene() -> (SceneGraph, SceneId, [NodeId; 3]) {
        let mut graph = SceneGraph::new();
        let scene = graph.create_scene();
        let root = graph.create_layer();
        graph.set_root(scene, root).unwrap();

        let specs = [((10, 10), (0, 0)), ((20, 5), (10, 0)), ((5, 5), (0, 10))];
        let views = specs.map(|((w, h), (x, y))| {
            let view = graph.create_view(w, h);
            graph.push(root, view).unwrap();
            graph.set_position(view, x, y).unwrap();
            view
        });
        (graph, scene, views)
    }

    #[test]
    fn test_three_views_exact_sizes() {
        let (graph, scene, _) = three_view_scene();

        let size = graph.get_vertex_index_sizes(scene).unwrap();
        assert_eq!(size.views, 3);
        assert_eq!(size.vertices(), 12);
        assert_eq!(size.indices(), 18);
        assert_eq!(size.vertex_bytes(), 12 * 16);

        let geometry = graph.traverse_and_emit(scene).unwrap();
        let floats: &[f32] = bytemuck::cast_slice(&geometry.vertices);
        assert_eq!(floats.len(), 48);
        let positions: Vec<f32> = geometry.vertices.iter().flat_map(|v| v.position).collect();
        assert_eq!(positions.len(), 24);
        assert_eq!(geometry.indices.len(), 18);
    }

    #[test]
    fn test_first_view_corners() {
        let (graph, scene, _) = three_view_scene();
        let geometry = graph.traverse_and_emit(scene).unwrap();

        let corners: Vec<[f32; 2]> = geometry.vertices[..4].iter().map(|v| v.position).collect();
        assert_eq!(corners, vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]);

        let uvs: Vec<[f32; 2]> = geometry.vertices[..4].iter().map(|v| v.tex_coord).collect();
        assert_eq!(uvs, vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_indices_offset_per_view() {
        let (graph, scene, _) = three_view_scene();
        let geometry = graph.traverse_and_emit(scene).unwrap();

        assert_eq!(
            geometry.indices,
            vec![0, 1, 2, 0, 2, 3, 4, 5, 6, 4, 6, 7, 8, 9, 10, 8, 10, 11]
        );
    }

    #[test]
    fn test_paint_order_follows_child_order() {
        let (mut graph, scene, [a, _, c]) = three_view_scene();
        // Move the first view to the top of the stack
        graph.insert_above(c, a).unwrap();

        let geometry = graph.traverse_and_emit(scene).unwrap();
        let origins: Vec<[f32; 2]> = geometry.vertices.iter().step_by(4).map(|v| v.position).collect();
        assert_eq!(origins, vec![[10.0, 0.0], [0.0, 10.0], [0.0, 0.0]]);
    }

    #[test]
    fn test_nested_offsets_accumulate() {
        let mut graph = SceneGraph::new();
        let scene = graph.create_scene();
        let root = graph.create_layer();
        let layer = graph.create_layer();
        let view = graph.create_view(3, 4);
        graph.set_root(scene, root).unwrap();
        graph.push(root, layer).unwrap();
        graph.push(layer, view).unwrap();
        graph.set_position(layer, 10, 10).unwrap();
        graph.set_position(view, 5, 5).unwrap();

        let geometry = graph.traverse_and_emit(scene).unwrap();
        assert_relative_eq!(geometry.vertices[0].position[0], 15.0);
        assert_relative_eq!(geometry.vertices[0].position[1], 15.0);
        assert_relative_eq!(geometry.vertices[2].position[0], 18.0);
        assert_relative_eq!(geometry.vertices[2].position[1], 19.0);
    }

    #[test]
    fn test_offsets_past_i32_range() {
        let mut graph = SceneGraph::new();
        let scene = graph.create_scene();
        let root = graph.create_layer();
        let view = graph.create_view(2, 2);
        graph.set_root(scene, root).unwrap();
        graph.push(root, view).unwrap();
        graph.set_position(root, i32::MAX, i32::MIN).unwrap();
        graph.set_position(view, 1, -1).unwrap();

        let geometry = graph.traverse_and_emit(scene).unwrap();
        let expected_x = (i64::from(i32::MAX) + 1) as f32;
        let expected_y = (i64::from(i32::MIN) - 1) as f32;
        assert_relative_eq!(geometry.vertices[0].position[0], expected_x);
        assert_relative_eq!(geometry.vertices[0].position[1], expected_y);
        assert!(geometry.vertices[0].position[0] > 0.0);
        assert!(geometry.vertices[0].position[1] < 0.0);
    }

    #[test]
    fn test_root_view_and_empty_scene() {
        let mut graph = SceneGraph::new();
        let scene = graph.create_scene();
        assert_eq!(graph.traverse_and_emit(scene).unwrap(), SceneGeometry::default());

        let view = graph.create_view(8, 8);
        graph.set_root(scene, view).unwrap();
        graph.set_position(view, 2, 3).unwrap();

        let geometry = graph.traverse_and_emit(scene).unwrap();
        assert_eq!(geometry.view_count(), 1);
        assert_eq!(geometry.vertices[0].position, [2.0, 3.0]);
    }

    #[test]
    fn test_detached_subtree_is_not_emitted() {
        let (mut graph, scene, [a, _, _]) = three_view_scene();
        graph.detach(a).unwrap();

        let geometry = graph.traverse_and_emit(scene).unwrap();
        assert_eq!(geometry.view_count(), 2);
        assert_eq!(geometry.vertices[0].position, [10.0, 0.0]);
    }

    #[test]
    fn test_too_many_views_is_an_error() {
        let mut graph = SceneGraph::new();
        let scene = graph.create_scene();
        let root = graph.create_layer();
        graph.set_root(scene, root).unwrap();
        for _ in 0..=(usize::from(u16::MAX) + 1) / VERTICES_PER_VIEW {
            let view = graph.create_view(1, 1);
            graph.push(root, view).unwrap();
        }

        assert_eq!(
            graph.get_vertex_index_sizes(scene),
            Err(SceneError::TooManyViews { views: 16_385 })
        );
    }

    #[test]
    #[should_panic(expected = "vertex buffer length mismatch")]
    fn test_wrong_buffer_length_panics() {
        let (graph, scene, _) = three_view_scene();
        let mut vertices = vec![QuadVertex::zeroed(); 4];
        let mut indices = vec![0u16; 18];
        let _ = graph.get_vertex_index_data(scene, &mut vertices, &mut indices);
    }
}
