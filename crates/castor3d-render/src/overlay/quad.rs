//! Vertex layouts of the three overlay shapes.
//!
//! Coordinates are in pixels relative to the overlay's top-left corner; the
//! vertex shader adds the absolute position from the overlay UBO.

use super::data::{BorderSize, Glyph};
use castor3d_core::OverlayConfig;
use castor3d_gpu::vk;
use glam::Vec2;

/// Vertex of panels and borders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct OverlayVertex {
    pub coords: [f32; 2],
    pub texture: [f32; 2],
}

/// Vertex of text glyphs, with the glyph atlas coordinate.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TextVertex {
    pub coords: [f32; 2],
    pub texture: [f32; 2],
    pub text: [f32; 2],
}

/// A fixed-capacity vertex layout one overlay slot holds.
pub trait OverlayQuad: 'static {
    type Vertex: bytemuck::Pod;

    /// Pool name, also used for logging.
    const NAME: &'static str;
    /// Whether the pipelines drawing it sample a font.
    const TEXT: bool;

    /// Vertices one slot can hold.
    fn capacity(config: &OverlayConfig) -> u32;

    /// Vertex input layout, with texture coordinates when `textured`.
    fn vertex_input(
        textured: bool,
    ) -> (
        Vec<vk::VertexInputBindingDescription>,
        Vec<vk::VertexInputAttributeDescription>,
    );
}

fn attribute(location: u32, offset: u32) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format: vk::Format::R32G32_SFLOAT,
        offset,
    }
}

fn binding(stride: usize) -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: stride as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

fn panel_input(
    textured: bool,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let mut attributes = vec![attribute(0, 0)];
    if textured {
        attributes.push(attribute(1, 8));
    }
    (vec![binding(std::mem::size_of::<OverlayVertex>())], attributes)
}

/// Two triangles covering `[min, max]`, with texture coordinates `[uv_min, uv_max]`.
fn rectangle(min: Vec2, max: Vec2, uv_min: Vec2, uv_max: Vec2) -> [OverlayVertex; 6] {
    let vertex = |x: f32, y: f32, u: f32, v: f32| OverlayVertex {
        coords: [x, y],
        texture: [u, v],
    };
    [
        vertex(min.x, min.y, uv_min.x, uv_min.y),
        vertex(min.x, max.y, uv_min.x, uv_max.y),
        vertex(max.x, min.y, uv_max.x, uv_min.y),
        vertex(max.x, min.y, uv_max.x, uv_min.y),
        vertex(min.x, max.y, uv_min.x, uv_max.y),
        vertex(max.x, max.y, uv_max.x, uv_max.y),
    ]
}

/// A plain panel: one rectangle.
pub struct PanelQuad;

impl PanelQuad {
    pub fn vertices(size: Vec2) -> Vec<OverlayVertex> {
        rectangle(Vec2::ZERO, size, Vec2::ZERO, Vec2::ONE).to_vec()
    }
}

impl OverlayQuad for PanelQuad {
    type Vertex = OverlayVertex;

    const NAME: &'static str = "PanelOverlays";
    const TEXT: bool = false;

    fn capacity(_config: &OverlayConfig) -> u32 {
        6
    }

    fn vertex_input(
        textured: bool,
    ) -> (
        Vec<vk::VertexInputBindingDescription>,
        Vec<vk::VertexInputAttributeDescription>,
    ) {
        panel_input(textured)
    }
}

/// The border of a border panel: eight rectangles, corners and edges.
pub struct BorderQuad;

impl BorderQuad {
    /// Border rectangles around a panel of `size`, `outside` being the part
    /// of `border` drawn beyond the panel edge.
    pub fn vertices(size: Vec2, border: BorderSize, outside: BorderSize) -> Vec<OverlayVertex> {
        let inner_min = Vec2::new(
            border.left as f32 - outside.left as f32,
            border.top as f32 - outside.top as f32,
        );
        let inner_max = size
            - Vec2::new(
                border.right as f32 - outside.right as f32,
                border.bottom as f32 - outside.bottom as f32,
            );
        let outer_min = Vec2::new(-(outside.left as f32), -(outside.top as f32));
        let outer_max = size + Vec2::new(outside.right as f32, outside.bottom as f32);
        let full = outer_max - outer_min;
        let uv = |point: Vec2| {
            if full.x > 0.0 && full.y > 0.0 {
                (point - outer_min) / full
            } else {
                Vec2::ZERO
            }
        };

        let xs = [outer_min.x, inner_min.x, inner_max.x, outer_max.x];
        let ys = [outer_min.y, inner_min.y, inner_max.y, outer_max.y];
        let mut vertices = Vec::with_capacity(48);
        for row in 0..3 {
            for column in 0..3 {
                if row == 1 && column == 1 {
                    continue;
                }
                let min = Vec2::new(xs[column], ys[row]);
                let max = Vec2::new(xs[column + 1], ys[row + 1]);
                vertices.extend_from_slice(&rectangle(min, max, uv(min), uv(max)));
            }
        }
        vertices
    }
}

impl OverlayQuad for BorderQuad {
    type Vertex = OverlayVertex;

    const NAME: &'static str = "BorderOverlays";
    const TEXT: bool = false;

    fn capacity(_config: &OverlayConfig) -> u32 {
        48
    }

    fn vertex_input(
        textured: bool,
    ) -> (
        Vec<vk::VertexInputBindingDescription>,
        Vec<vk::VertexInputAttributeDescription>,
    ) {
        panel_input(textured)
    }
}

/// Text: one rectangle per glyph.
pub struct TextQuad;

impl TextQuad {
    /// Glyph rectangles for a text of `size`, at most `max_chars` of them.
    pub fn vertices(size: Vec2, glyphs: &[Glyph], max_chars: u32) -> Vec<TextVertex> {
        let mut vertices = Vec::with_capacity(glyphs.len().min(max_chars as usize) * 6);
        for glyph in glyphs.iter().take(max_chars as usize) {
            let min = glyph.position;
            let max = glyph.position + glyph.size;
            let [u0, v0, u1, v1] = glyph.atlas;
            let uv = |point: Vec2| {
                if size.x > 0.0 && size.y > 0.0 {
                    point / size
                } else {
                    Vec2::ZERO
                }
            };
            let corners = rectangle(min, max, uv(min), uv(max));
            let atlas = [
                [u0, v0],
                [u0, v1],
                [u1, v0],
                [u1, v0],
                [u0, v1],
                [u1, v1],
            ];
            vertices.extend(corners.iter().zip(atlas).map(|(corner, text)| TextVertex {
                coords: corner.coords,
                texture: corner.texture,
                text,
            }));
        }
        vertices
    }
}

impl OverlayQuad for TextQuad {
    type Vertex = TextVertex;

    const NAME: &'static str = "TextOverlays";
    const TEXT: bool = true;

    fn capacity(config: &OverlayConfig) -> u32 {
        config.max_chars_per_overlay * 6
    }

    fn vertex_input(
        textured: bool,
    ) -> (
        Vec<vk::VertexInputBindingDescription>,
        Vec<vk::VertexInputAttributeDescription>,
    ) {
        let mut attributes = vec![attribute(0, 0)];
        if textured {
            attributes.push(attribute(1, 8));
        }
        attributes.push(attribute(2, 16));
        (vec![binding(std::mem::size_of::<TextVertex>())], attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_fill_their_capacity() {
        let config = OverlayConfig::default();
        let size = Vec2::new(100.0, 50.0);
        assert_eq!(PanelQuad::vertices(size).len() as u32, PanelQuad::capacity(&config));
        let border = BorderSize::uniform(4);
        assert_eq!(
            BorderQuad::vertices(size, border, border).len() as u32,
            BorderQuad::capacity(&config)
        );
    }

    #[test]
    fn text_is_truncated_to_the_slot() {
        let glyph = Glyph {
            position: Vec2::ZERO,
            size: Vec2::splat(8.0),
            atlas: [0.0, 0.0, 0.1, 0.1],
        };
        let vertices = TextQuad::vertices(Vec2::new(64.0, 8.0), &[glyph; 5], 3);
        assert_eq!(vertices.len(), 18);
        assert_eq!(vertices[5].text, [0.1, 0.1]);
    }

    #[test]
    fn external_border_surrounds_the_panel() {
        let size = Vec2::new(10.0, 10.0);
        let border = BorderSize::uniform(2);
        let vertices = BorderQuad::vertices(size, border, border);
        let min_x = vertices.iter().map(|v| v.coords[0]).fold(f32::MAX, f32::min);
        let max_x = vertices.iter().map(|v| v.coords[0]).fold(f32::MIN, f32::max);
        assert_eq!(min_x, -2.0);
        assert_eq!(max_x, 12.0);
        // No rectangle covers the panel centre.
        assert!(!vertices
            .chunks(6)
            .any(|quad| quad[0].coords == [0.0, 0.0] && quad[5].coords == [10.0, 10.0]));
    }
}
