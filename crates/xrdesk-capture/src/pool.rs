//! Epoch-tagged cache of small staging textures.

use tracing::debug;
use xrdesk_ipc::CaptureConfig;

use crate::gpu::{GpuDevice, MapMode, TextureDesc};
use crate::staging::StagingTexture;
use crate::{CaptureError, CaptureResult};

/// Sizing rules for a [`StagingTexturePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Slots per arena.
    pub capacity: usize,

    /// Requests at or below this in both axes go to the small arena.
    pub small_limit: u32,

    /// Allocation sizes are rounded up to a multiple of this.
    pub rounding: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for PoolSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            capacity: config.pool_capacity,
            small_limit: config.pool_small_limit,
            rounding: config.pool_rounding,
        }
    }
}

/// Which arena a slot lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaKind {
    Small,
    Large,
}

/// Identifies one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub arena: ArenaKind,
    pub index: usize,
}

/// A slot handed out by [`StagingTexturePool::acquire`].
pub struct PoolLease<'a, G: GpuDevice> {
    pub id: SlotId,
    pub texture: &'a mut StagingTexture<G>,
}

struct Slot<G: GpuDevice> {
    texture: StagingTexture<G>,
    epoch: u64,
}

/// Two arenas of reusable staging textures.
///
/// Cursor-sized copies are frequent and tiny, so they get their own arena and
/// do not evict the larger dirty-rect buffers. Each capture cycle uses a new
/// epoch; a slot tagged with the current epoch is never handed out twice.
pub struct StagingTexturePool<G: GpuDevice> {
    small: Vec<Slot<G>>,
    large: Vec<Slot<G>>,
    settings: PoolSettings,
}

impl<G: GpuDevice> StagingTexturePool<G> {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            small: Vec::with_capacity(settings.capacity),
            large: Vec::with_capacity(settings.capacity),
            settings,
        }
    }

    fn is_small(&self, width: u32, height: u32) -> bool {
        width <= self.settings.small_limit && height <= self.settings.small_limit
    }

    fn round_up(&self, value: u32) -> u32 {
        let step = self.settings.rounding.max(1);
        value.div_ceil(step) * step
    }

    /// Returns a texture of at least `width` x `height` not yet used in `epoch`.
    ///
    /// `example` supplies format, mips and sample count for new allocations.
    pub fn acquire(
        &mut self,
        device: &G,
        example: &TextureDesc,
        mode: MapMode,
        width: u32,
        height: u32,
        epoch: u64,
    ) -> CaptureResult<PoolLease<'_, G>> {
        let kind = if self.is_small(width, height) {
            ArenaKind::Small
        } else {
            ArenaKind::Large
        };
        let capacity = self.settings.capacity;
        let alloc_width = self.round_up(width);
        let alloc_height = self.round_up(height);

        let arena = match kind {
            ArenaKind::Small => &mut self.small,
            ArenaKind::Large => &mut self.large,
        };

        let mut stalest: Option<(usize, u64)> = None;
        let mut found = None;
        for (index, slot) in arena.iter().enumerate() {
            if slot.epoch == epoch {
                continue;
            }
            if slot.texture.mode() == mode
                && slot.texture.width() >= width
                && slot.texture.height() >= height
            {
                found = Some(index);
                break;
            }
            let delta = epoch.wrapping_sub(slot.epoch);
            if stalest.map_or(true, |(_, best)| delta > best) {
                stalest = Some((index, delta));
            }
        }

        if let Some(index) = found {
            let slot = &mut arena[index];
            slot.epoch = epoch;
            return Ok(PoolLease {
                id: SlotId { arena: kind, index },
                texture: &mut slot.texture,
            });
        }

        // Every slot already serves this epoch
        if arena.len() >= capacity && stalest.is_none() {
            return Err(CaptureError::PoolExhausted { epoch });
        }

        let mut texture = StagingTexture::new();
        texture.prepare(device, mode, &example.with_size(alloc_width, alloc_height))?;
        let slot = Slot { texture, epoch };

        let index = match stalest {
            _ if arena.len() < capacity => {
                arena.push(slot);
                arena.len() - 1
            }
            None => return Err(CaptureError::PoolExhausted { epoch }),
            Some((index, _)) => {
                debug!(?kind, index, "Evicting stale pool slot");
                arena[index] = slot;
                index
            }
        };

        Ok(PoolLease {
            id: SlotId { arena: kind, index },
            texture: &mut arena[index].texture,
        })
    }

    /// Number of slots currently allocated in an arena.
    pub fn len(&self, kind: ArenaKind) -> usize {
        match kind {
            ArenaKind::Small => self.small.len(),
            ArenaKind::Large => self.large.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.small.is_empty() && self.large.is_empty()
    }

    /// Releases every slot.
    pub fn clear(&mut self) {
        self.small.clear();
        self.large.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::software::SoftDevice;

    fn pool() -> StagingTexturePool<SoftDevice> {
        StagingTexturePool::new(PoolSettings::default())
    }

    #[test]
    fn test_sizes_round_up_to_64() {
        let device = SoftDevice::new();
        let mut pool = pool();
        let lease = pool
            .acquire(&device, &TextureDesc::bgra(1, 1), MapMode::Write, 130, 70, 1)
            .unwrap();
        assert_eq!(lease.id.arena, ArenaKind::Large);
        assert_eq!((lease.texture.width(), lease.texture.height()), (192, 128));
    }

    #[test]
    fn test_small_and_large_arenas_are_separate() {
        let device = SoftDevice::new();
        let mut pool = pool();
        let example = TextureDesc::bgra(1920, 1080);
        let small = pool.acquire(&device, &example, MapMode::Write, 32, 32, 1).unwrap().id;
        let large = pool.acquire(&device, &example, MapMode::Write, 300, 20, 1).unwrap().id;
        let edge = pool.acquire(&device, &example, MapMode::Write, 128, 128, 1).unwrap().id;
        assert_eq!(small.arena, ArenaKind::Small);
        assert_eq!(large.arena, ArenaKind::Large);
        assert_eq!(edge.arena, ArenaKind::Small);
        assert_eq!(pool.len(ArenaKind::Small), 2);
        assert_eq!(pool.len(ArenaKind::Large), 1);
    }

    #[test]
    fn test_slot_not_reused_within_epoch() {
        let device = SoftDevice::new();
        let mut pool = pool();
        let example = TextureDesc::bgra(1, 1);

        let mut seen = HashSet::new();
        for _ in 0..8 {
            let lease = pool.acquire(&device, &example, MapMode::Write, 16, 16, 7).unwrap();
            assert!(seen.insert(lease.id), "slot {:?} reused in one epoch", lease.id);
        }

        // Ninth request in the same epoch has nowhere to go
        let result = pool.acquire(&device, &example, MapMode::Write, 16, 16, 7);
        assert!(matches!(result, Err(CaptureError::PoolExhausted { epoch: 7 })));
    }

    #[test]
    fn test_slots_reused_across_epochs() {
        let device = SoftDevice::new();
        let mut pool = pool();
        let example = TextureDesc::bgra(1, 1);

        for epoch in 1..=5 {
            let a = pool.acquire(&device, &example, MapMode::Write, 20, 20, epoch).unwrap().id;
            let b = pool.acquire(&device, &example, MapMode::Write, 20, 20, epoch).unwrap().id;
            assert_ne!(a, b);
        }
        assert_eq!(pool.len(ArenaKind::Small), 2);
        assert_eq!(device.stats().textures_created, 2);
    }

    #[test]
    fn test_evicts_stalest_slot_at_capacity() {
        let device = SoftDevice::new();
        let mut pool = pool();
        let example = TextureDesc::bgra(1, 1);

        // Fill the small arena with 64x64 slots; slot i is tagged epoch i + 1
        for epoch in 1..=8 {
            pool.acquire(&device, &example, MapMode::Write, 64, 64, epoch).unwrap();
        }

        // Bigger requests cannot reuse anything and evict the stalest slots in turn
        let lease = pool.acquire(&device, &example, MapMode::Write, 128, 128, 9).unwrap();
        assert_eq!(lease.id.index, 0);
        assert_eq!(lease.texture.width(), 128);
        let lease = pool.acquire(&device, &example, MapMode::Write, 128, 128, 9).unwrap();
        assert_eq!(lease.id.index, 1);
        assert_eq!(pool.len(ArenaKind::Small), 8);

        // The replaced slot serves a later epoch
        let lease = pool.acquire(&device, &example, MapMode::Write, 100, 100, 10).unwrap();
        assert_eq!(lease.id.index, 0);
    }

    #[test]
    fn test_allocation_failure_returns_error() {
        let device = SoftDevice::new();
        device.fail_allocations(true);
        let mut pool = pool();
        let result = pool.acquire(&device, &TextureDesc::bgra(1, 1), MapMode::Read, 8, 8, 1);
        assert!(matches!(result, Err(CaptureError::AllocationFailed(_))));
        assert!(pool.is_empty());
    }
}
