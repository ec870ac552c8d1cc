//! Queue family discovery.
//!
//! Matches the queue families reported by a physical device against the
//! capabilities the renderer needs: graphics and presentation to a surface. Presentation support is surface-specific, so it is passed in as a
//! predicate rather than read from the family flags.

use ash::vk;

/// Snapshot of one queue family as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
}

impl QueueFamilyInfo {
    /// Build snapshots from raw driver properties.
    pub fn from_properties(properties: &[vk::QueueFamilyProperties]) -> Vec<Self> {
        properties
            .iter()
            .enumerate()
            .map(|(i, props)| Self {
                index: i as u32,
                flags: props.queue_flags,
                queue_count: props.queue_count,
            })
            .collect()
    }

    fn supports(&self, flags: vk::QueueFlags) -> bool {
        self.queue_count > 0 && self.flags.contains(flags)
    }
}

/// Queue family indices chosen for the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilySelection {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilySelection {
    /// Whether graphics and presentation share one family.
    pub fn present_is_graphics(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, in ascending order, for device creation.
    pub fn unique_families(&self) -> Vec<u32> {
        if self.present_is_graphics() {
            vec![self.graphics]
        } else {
            let mut families = vec![self.graphics, self.present];
            families.sort_unstable();
            families
        }
    }
}

/// Find graphics and present queue families.
///
/// Uploads go through the graphics queue, so no separate transfer family is
/// selected.
///
/// `required` is the set of flags the graphics family must carry in addition
/// to `GRAPHICS`. A family that can both draw and present is preferred so that
/// swapchain images never change queue ownership. Returns `None` when no
/// family can draw or none can present.
pub fn find_queue_families<F>(
    families: &[QueueFamilyInfo],
    required: vk::QueueFlags,
    mut supports_present: F,
) -> Option<QueueFamilySelection>
where
    F: FnMut(u32) -> bool,
{
    let graphics_flags = vk::QueueFlags::GRAPHICS | required;

    let mut graphics = None;
    let mut present = None;
    let mut combined = None;

    for family in families.iter().filter(|f| f.queue_count > 0) {
        let can_draw = family.supports(graphics_flags);
        let can_present = supports_present(family.index);

        if can_draw && can_present && combined.is_none() {
            combined = Some(family.index);
        }
        if can_draw && graphics.is_none() {
            graphics = Some(family.index);
        }
        if can_present && present.is_none() {
            present = Some(family.index);
        }
    }

    let (graphics, present) = match combined {
        Some(index) => (index, index),
        None => (graphics?, present?),
    };

    Some(QueueFamilySelection { graphics, present })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, flags: vk::QueueFlags) -> QueueFamilyInfo {
        QueueFamilyInfo {
            index,
            flags,
            queue_count: 1,
        }
    }

    #[test]
    fn prefers_combined_graphics_present_family() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(1, vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];

        let selection =
            find_queue_families(&families, vk::QueueFlags::empty(), |i| i == 1).unwrap();

        assert_eq!(selection.graphics, 1);
        assert_eq!(selection.present, 1);
        assert!(selection.present_is_graphics());
    }

    #[test]
    fn splits_families_when_no_combined_exists() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS),
            family(1, vk::QueueFlags::COMPUTE),
        ];

        let selection =
            find_queue_families(&families, vk::QueueFlags::empty(), |i| i == 1).unwrap();

        assert_eq!(selection.graphics, 0);
        assert_eq!(selection.present, 1);
        assert_eq!(selection.unique_families(), vec![0, 1]);
    }

    #[test]
    fn transfer_only_families_get_no_queue() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(1, vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(2, vk::QueueFlags::TRANSFER),
        ];

        let selection = find_queue_families(&families, vk::QueueFlags::empty(), |_| true).unwrap();

        assert_eq!(selection.graphics, 0);
        assert_eq!(selection.unique_families(), vec![0]);
    }

    #[test]
    fn missing_present_support_fails() {
        let families = [family(0, vk::QueueFlags::GRAPHICS)];
        assert!(find_queue_families(&families, vk::QueueFlags::empty(), |_| false).is_none());
    }

    #[test]
    fn empty_families_are_ignored() {
        let families = [
            QueueFamilyInfo {
                index: 0,
                flags: vk::QueueFlags::GRAPHICS,
                queue_count: 0,
            },
            family(1, vk::QueueFlags::GRAPHICS),
        ];

        let selection = find_queue_families(&families, vk::QueueFlags::empty(), |_| true).unwrap();
        assert_eq!(selection.graphics, 1);
    }

    #[test]
    fn required_flags_narrow_graphics_choice() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS),
            family(1, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];

        let selection =
            find_queue_families(&families, vk::QueueFlags::COMPUTE, |_| true).unwrap();
        assert_eq!(selection.graphics, 1);
    }
}
