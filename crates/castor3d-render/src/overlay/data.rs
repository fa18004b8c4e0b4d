//! The overlay state the renderer consumes.
//!
//! Overlays live in the UI layer; the renderer only reads them while
//! preparing a frame. Positions and sizes are relative to the render target,
//! border widths are in pixels.

use castor3d_gpu::vk;
use bitflags::bitflags;
use glam::Vec2;

/// Stable identity of an overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverlayId(pub u64);

/// Stable identity of a material pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub u64);

bitflags! {
    /// What a material pass's textures feed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        const COLOUR = 1 << 0;
        const OPACITY = 1 << 1;
    }
}

/// A texture bound by a material pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassTexture {
    pub flags: TextureFlags,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// One pass of an overlay material.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialPass {
    pub id: PassId,
    /// Implicit passes are generated internally and never drawn.
    pub implicit: bool,
    pub colour: [f32; 4],
    pub opacity: f32,
    pub textures: Vec<PassTexture>,
}

impl MaterialPass {
    pub fn new(id: u64, colour: [f32; 4]) -> Self {
        Self {
            id: PassId(id),
            implicit: false,
            colour,
            opacity: 1.0,
            textures: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_texture(mut self, texture: PassTexture) -> Self {
        self.textures.push(texture);
        self
    }

    /// Union of the flags of every texture.
    pub fn texture_flags(&self) -> TextureFlags {
        self.textures
            .iter()
            .fold(TextureFlags::empty(), |flags, texture| flags | texture.flags)
    }

    pub fn texture_count(&self) -> u32 {
        self.textures.len() as u32
    }
}

/// Glyph atlas of a font.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontTexture {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// One glyph of a text overlay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Glyph {
    /// Top-left corner relative to the overlay, in pixels.
    pub position: Vec2,
    /// Size in pixels.
    pub size: Vec2,
    /// Atlas rectangle as `[u0, v0, u1, v1]`.
    pub atlas: [f32; 4],
}

/// Where a border is drawn relative to the panel edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BorderPosition {
    /// Entirely inside the panel.
    #[default]
    Internal,
    /// Centred on the edge.
    Middle,
    /// Entirely outside the panel.
    External,
}

/// Border widths in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BorderSize {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl BorderSize {
    pub const fn uniform(width: u32) -> Self {
        Self {
            left: width,
            top: width,
            right: width,
            bottom: width,
        }
    }

    /// The part of the border lying outside the panel.
    pub const fn outside(self, position: BorderPosition) -> Self {
        match position {
            BorderPosition::Internal => Self::uniform(0),
            BorderPosition::Middle => Self {
                left: self.left / 2,
                top: self.top / 2,
                right: self.right / 2,
                bottom: self.bottom / 2,
            },
            BorderPosition::External => self,
        }
    }
}

/// What an overlay draws.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayKind {
    Panel,
    BorderPanel {
        border: BorderSize,
        border_position: BorderPosition,
        border_material: Vec<MaterialPass>,
    },
    Text {
        font: FontTexture,
        glyphs: Vec<Glyph>,
    },
}

/// A 2D overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub id: OverlayId,
    pub visible: bool,
    /// Top-left corner, relative to the target.
    pub position: Vec2,
    /// Size relative to the target.
    pub size: Vec2,
    pub material: Vec<MaterialPass>,
    pub kind: OverlayKind,
}

impl Overlay {
    pub fn panel(id: u64, position: Vec2, size: Vec2, material: Vec<MaterialPass>) -> Self {
        Self {
            id: OverlayId(id),
            visible: true,
            position,
            size,
            material,
            kind: OverlayKind::Panel,
        }
    }

    pub fn border_panel(
        id: u64,
        position: Vec2,
        size: Vec2,
        material: Vec<MaterialPass>,
        border: BorderSize,
        border_position: BorderPosition,
        border_material: Vec<MaterialPass>,
    ) -> Self {
        Self {
            kind: OverlayKind::BorderPanel {
                border,
                border_position,
                border_material,
            },
            ..Self::panel(id, position, size, material)
        }
    }

    pub fn text(
        id: u64,
        position: Vec2,
        size: Vec2,
        material: Vec<MaterialPass>,
        font: FontTexture,
        glyphs: Vec<Glyph>,
    ) -> Self {
        Self {
            kind: OverlayKind::Text { font, glyphs },
            ..Self::panel(id, position, size, material)
        }
    }

    /// Top-left corner in pixels of a `target` sized surface.
    pub fn absolute_position(&self, target: vk::Extent2D) -> Vec2 {
        self.position * extent_vec(target)
    }

    /// Size in pixels of a `target` sized surface.
    pub fn absolute_size(&self, target: vk::Extent2D) -> Vec2 {
        self.size * extent_vec(target)
    }
}

pub(crate) fn extent_vec(extent: vk::Extent2D) -> Vec2 {
    Vec2::new(extent.width as f32, extent.height as f32)
}
