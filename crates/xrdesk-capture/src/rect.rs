//! Rectangles and per-frame change sets.

/// A rectangle in desktop texture coordinates (right/bottom exclusive).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Creates a rectangle from its top-left corner and size.
    pub fn from_size(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self::new(x, y, x + width as i32, y + height as i32)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    /// Returns the overlapping region, or `None` if the rectangles do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        (!r.is_empty()).then_some(r)
    }

    /// Clips the rectangle to `[0, width) x [0, height)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        self.intersect(&Rect::new(0, 0, width as i32, height as i32))
    }

    /// Grows right/bottom by `amount`, never past the desktop size.
    ///
    /// GDI cursors leave trails just outside the dirty rects the OS reports,
    /// so every dirty rect is widened before it is copied.
    pub fn expand_dirty(&self, amount: u32, width: u32, height: u32) -> Rect {
        let amount = amount as i32;
        Rect::new(
            self.left,
            self.top,
            (self.right + amount).min(width as i32),
            (self.bottom + amount).min(height as i32),
        )
    }
}

/// A region the OS moved from one place on the desktop to another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveRect {
    /// Top-left corner of the source region.
    pub source_x: i32,
    pub source_y: i32,

    /// Where the region ends up.
    pub destination: Rect,
}

impl MoveRect {
    pub fn new(source_x: i32, source_y: i32, destination: Rect) -> Self {
        Self {
            source_x,
            source_y,
            destination,
        }
    }

    /// The rectangle the pixels are read from.
    pub fn source_rect(&self) -> Rect {
        Rect::new(
            self.source_x,
            self.source_y,
            self.source_x + self.destination.width(),
            self.source_y + self.destination.height(),
        )
    }

    /// Clips the destination to the desktop and shifts the source point by
    /// the same amount. `None` if the destination or the source lies wholly
    /// outside.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<MoveRect> {
        let destination = self.destination.clamp_to(width, height)?;
        let clipped = MoveRect::new(
            self.source_x + (destination.left - self.destination.left),
            self.source_y + (destination.top - self.destination.top),
            destination,
        );
        clipped.source_rect().clamp_to(width, height)?;
        Some(clipped)
    }
}

/// The move and dirty rectangles of one capture cycle.
///
/// Moves are applied in order and always before any dirty rect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameDelta {
    pub moves: Vec<MoveRect>,
    pub dirty: Vec<Rect>,
}

impl FrameDelta {
    pub fn clear(&mut self) {
        self.moves.clear();
        self.dirty.clear();
    }

    /// Replaces the delta with a single dirty rect covering the desktop.
    pub fn set_full(&mut self, width: u32, height: u32) {
        self.clear();
        self.dirty.push(Rect::new(0, 0, width as i32, height as i32));
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.dirty.is_empty()
    }

    pub fn rect_count(&self) -> usize {
        self.moves.len() + self.dirty.len()
    }

    /// Applies the cursor-trail expansion to every dirty rect.
    pub fn expand_dirty(&mut self, amount: u32, width: u32, height: u32) {
        for rect in &mut self.dirty {
            *rect = rect.expand_dirty(amount, width, height);
        }
    }

    /// Drops rects that fall outside the desktop and clips the rest.
    pub fn clip_to(&mut self, width: u32, height: u32) {
        self.dirty.retain_mut(|rect| match rect.clamp_to(width, height) {
            Some(clipped) => {
                *rect = clipped;
                true
            }
            None => false,
        });
        self.moves.retain_mut(|mv| match mv.clamp_to(width, height) {
            Some(clipped) => {
                *mv = clipped;
                true
            }
            None => false,
        });
    }
}
