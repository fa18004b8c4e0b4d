//! Owned images, views and samplers.

use crate::device::{color_range, Device, ImageDesc, ImageViewDesc, SamplerDesc};
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// An image with a view over all of its subresources.
///
/// Extra views made through [`GpuImage::sub_view`] are owned by the image and
/// destroyed with it.
pub struct GpuImage {
    device: Arc<dyn Device>,
    name: String,
    image: vk::Image,
    view: vk::ImageView,
    sub_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
}

impl GpuImage {
    /// Create the image and its full view of type `view_type`.
    pub fn new(
        device: Arc<dyn Device>,
        desc: &ImageDesc<'_>,
        view_type: vk::ImageViewType,
    ) -> Result<Self> {
        let image = device.create_image(desc)?;
        let view = match device.create_image_view(&ImageViewDesc {
            image,
            view_type,
            format: desc.format,
            range: vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(desc.format),
                ..color_range(desc.mip_levels, desc.array_layers)
            },
        }) {
            Ok(view) => view,
            Err(err) => {
                device.destroy_image(image);
                return Err(err);
            }
        };

        tracing::debug!(
            name = desc.name,
            width = desc.extent.width,
            height = desc.extent.height,
            depth = desc.extent.depth,
            mips = desc.mip_levels,
            layers = desc.array_layers,
            "Created image"
        );

        Ok(Self {
            device,
            name: desc.name.to_owned(),
            image,
            view,
            sub_views: Vec::new(),
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// View over every mip level and layer.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    /// Subresource range covering the whole image.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(self.format),
            ..color_range(self.mip_levels, self.array_layers)
        }
    }

    /// Range of one mip level over `layer_count` layers from `base_layer`.
    pub fn sub_range(&self, mip_level: u32, base_layer: u32, layer_count: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(self.format),
            base_mip_level: mip_level,
            level_count: 1,
            base_array_layer: base_layer,
            layer_count,
        }
    }

    /// Extent of mip `level`, never below one texel per axis.
    pub fn mip_extent(&self, level: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extent.width >> level).max(1),
            height: (self.extent.height >> level).max(1),
            depth: (self.extent.depth >> level).max(1),
        }
    }

    /// Create a view of one mip level over `layer_count` layers from `base_layer`.
    pub fn sub_view(
        &mut self,
        view_type: vk::ImageViewType,
        mip_level: u32,
        base_layer: u32,
        layer_count: u32,
    ) -> Result<vk::ImageView> {
        let view = self.device.create_image_view(&ImageViewDesc {
            image: self.image,
            view_type,
            format: self.format,
            range: self.sub_range(mip_level, base_layer, layer_count),
        })?;
        self.sub_views.push(view);
        Ok(view)
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        for view in self.sub_views.drain(..) {
            self.device.destroy_image_view(view);
        }
        self.device.destroy_image_view(self.view);
        self.device.destroy_image(self.image);
    }
}

/// An owned sampler.
pub struct Sampler {
    device: Arc<dyn Device>,
    sampler: vk::Sampler,
}

impl Sampler {
    pub fn new(device: Arc<dyn Device>, desc: &SamplerDesc) -> Result<Self> {
        let sampler = device.create_sampler(desc)?;
        Ok(Self { device, sampler })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.destroy_sampler(self.sampler);
    }
}

/// Aspect a view of `format` covers.
pub const fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM
        | vk::Format::D32_SFLOAT
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Number of mip levels of a full chain for `size`.
pub const fn full_mip_count(size: u32) -> u32 {
    if size == 0 {
        1
    } else {
        32 - size.leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn mip_counts() {
        assert_eq!(full_mip_count(1), 1);
        assert_eq!(full_mip_count(128), 8);
        assert_eq!(full_mip_count(100), 7);
    }

    #[test]
    fn views_are_released_with_the_image() {
        let device = Arc::new(MockDevice::new());
        let desc = ImageDesc::new_cube("Env", vk::Format::R16G16B16A16_SFLOAT, 64).mip_levels(7);
        let mut image = GpuImage::new(device.clone(), &desc, vk::ImageViewType::CUBE).unwrap();
        for face in 0..6 {
            image
                .sub_view(vk::ImageViewType::TYPE_2D, 0, face, 1)
                .unwrap();
        }
        assert_eq!(device.live_image_view_count(), 7);
        assert_eq!(image.mip_extent(6).width, 1);
        assert_eq!(image.mip_extent(2).height, 16);

        drop(image);
        assert_eq!(device.live_image_view_count(), 0);
        assert_eq!(device.live_image_count(), 0);
    }

    #[test]
    fn depth_images_use_the_depth_aspect() {
        let device = Arc::new(MockDevice::new());
        let desc = ImageDesc::new_2d("Shadow", vk::Format::D32_SFLOAT, 256, 256).array_layers(6);
        let image = GpuImage::new(device, &desc, vk::ImageViewType::TYPE_2D_ARRAY).unwrap();
        assert_eq!(image.full_range().aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(image.sub_range(0, 3, 1).base_array_layer, 3);
    }
}
