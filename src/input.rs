//! Deciding whether touch input belongs to the overlay or the host.
//!
//! The overlay reports where its windows were drawn each frame; touches are
//! hit-tested against those rectangles when a pointer goes down, and the
//! decision sticks to the pointer until it goes up again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

pub mod legacy;
pub mod preloader;

/// Rectangle of an overlay window in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl WindowRect {
    pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowBounds {
    pub rect: WindowRect,
    pub visible: bool,
}

impl WindowBounds {
    /// Edges count as inside. Hidden windows contain nothing.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let r = &self.rect;
        self.visible && x >= r.x && x <= r.x + r.w && y >= r.y && y <= r.y + r.h
    }
}

/// Bounds of every overlay window, shared by the render and input threads.
/// The lock is only held to copy records in or out.
#[derive(Debug)]
pub struct BoundsTable {
    records: Mutex<Vec<WindowBounds>>,
}

impl BoundsTable {
    pub fn new(windows: usize) -> Self {
        Self {
            records: Mutex::new(vec![WindowBounds::default(); windows]),
        }
    }

    fn with_records<T>(&self, func: impl FnOnce(&mut Vec<WindowBounds>) -> T) -> T {
        func(&mut self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_drawn(&self, index: usize, rect: WindowRect) {
        self.with_records(|records| {
            if let Some(r) = records.get_mut(index) {
                *r = WindowBounds {
                    rect,
                    visible: true,
                };
            }
        });
    }

    pub fn set_hidden(&self, index: usize) {
        self.with_records(|records| {
            if let Some(r) = records.get_mut(index) {
                r.visible = false;
            }
        });
    }

    pub fn snapshot(&self) -> Vec<WindowBounds> {
        self.with_records(|records| records.clone())
    }

    pub fn hit_test(&self, x: f32, y: f32) -> bool {
        self.with_records(|records| records.iter().any(|b| b.contains(x, y)))
    }
}

/// Normalised `AMotionEvent` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Up,
    Move,
    Cancel,
}

impl TouchAction {
    /// Decodes the low byte of an Android motion action. Secondary pointers
    /// going down or up are treated like the primary one.
    pub fn from_raw(action: i32) -> Option<Self> {
        match action & 0xff {
            0 | 5 => Some(Self::Down),
            1 | 6 => Some(Self::Up),
            2 => Some(Self::Move),
            3 => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// Last known pointer, read by the overlay at the start of each frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointerState {
    pub x: f32,
    pub y: f32,
    pub down: bool,
}

#[derive(Debug, Default)]
pub struct PointerTracker(Mutex<PointerState>);

impl PointerTracker {
    pub fn get(&self) -> PointerState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, x: f32, y: f32, down: Option<bool>) {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        state.x = x;
        state.y = y;
        if let Some(down) = down {
            state.down = down;
        }
    }
}

/// Per-pointer capture state machine.
#[derive(Debug)]
pub struct InputArbiter {
    bounds: Arc<BoundsTable>,
    pointer: Arc<PointerTracker>,
    captured: Mutex<HashMap<i32, bool>>,
}

impl InputArbiter {
    pub fn new(bounds: Arc<BoundsTable>, pointer: Arc<PointerTracker>) -> Self {
        Self {
            bounds,
            pointer,
            captured: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether the overlay consumes the event, i.e. whether the host
    /// must not see it.
    pub fn on_touch(&self, action: i32, pointer_id: i32, x: f32, y: f32) -> bool {
        let Some(action) = TouchAction::from_raw(action) else {
            self.pointer.update(x, y, None);
            return false;
        };
        let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
        let consumed = match action {
            TouchAction::Down => {
                self.pointer.update(x, y, Some(true));
                let inside = self.bounds.hit_test(x, y);
                captured.insert(pointer_id, inside);
                inside
            }
            TouchAction::Move => {
                self.pointer.update(x, y, None);
                captured.get(&pointer_id).copied().unwrap_or(false)
            }
            TouchAction::Up | TouchAction::Cancel => {
                self.pointer.update(x, y, Some(false));
                captured.remove(&pointer_id).unwrap_or(false)
            }
        };
        trace!(?action, pointer_id, x, y, consumed, "touch");
        consumed
    }

    pub fn is_captured(&self, pointer_id: i32) -> bool {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pointer_id)
            .copied()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOWN: i32 = 0;
    const UP: i32 = 1;
    const MOVE: i32 = 2;
    const CANCEL: i32 = 3;

    fn arbiter_with_window() -> (InputArbiter, Arc<BoundsTable>, Arc<PointerTracker>) {
        let bounds = Arc::new(BoundsTable::new(3));
        bounds.set_drawn(0, WindowRect::new(10.0, 10.0, 20.0, 20.0));
        let pointer = Arc::new(PointerTracker::default());
        (
            InputArbiter::new(bounds.clone(), pointer.clone()),
            bounds,
            pointer,
        )
    }

    #[test]
    fn test_bounds_contains() {
        let b = WindowBounds {
            rect: WindowRect::new(10.0, 10.0, 20.0, 20.0),
            visible: true,
        };
        assert!(b.contains(15.0, 15.0));
        assert!(b.contains(10.0, 30.0));
        assert!(!b.contains(5.0, 5.0));
        assert!(!b.contains(30.5, 15.0));
        let hidden = WindowBounds {
            visible: false,
            ..b
        };
        assert!(!hidden.contains(15.0, 15.0));
    }

    #[test]
    fn test_action_decoding() {
        assert_eq!(TouchAction::from_raw(0), Some(TouchAction::Down));
        assert_eq!(TouchAction::from_raw(1), Some(TouchAction::Up));
        assert_eq!(TouchAction::from_raw(2), Some(TouchAction::Move));
        assert_eq!(TouchAction::from_raw(3), Some(TouchAction::Cancel));
        // pointer index bits above the low byte are ignored
        assert_eq!(TouchAction::from_raw(0x0105), Some(TouchAction::Down));
        assert_eq!(TouchAction::from_raw(0x0106), Some(TouchAction::Up));
        assert_eq!(TouchAction::from_raw(7), None);
    }

    #[test]
    fn test_press_inside_is_consumed() {
        let (arbiter, _, _) = arbiter_with_window();
        assert!(arbiter.on_touch(DOWN, 0, 15.0, 15.0));
        assert!(arbiter.is_captured(0));
    }

    #[test]
    fn test_press_outside_passes_through() {
        let (arbiter, _, _) = arbiter_with_window();
        assert!(!arbiter.on_touch(DOWN, 0, 5.0, 5.0));
        // dragging into the window does not capture mid-sequence
        assert!(!arbiter.on_touch(MOVE, 0, 15.0, 15.0));
        assert!(!arbiter.on_touch(UP, 0, 15.0, 15.0));
    }

    #[test]
    fn test_drag_out_stays_captured() {
        let (arbiter, _, pointer) = arbiter_with_window();
        assert!(arbiter.on_touch(DOWN, 0, 15.0, 15.0));
        assert!(arbiter.on_touch(MOVE, 0, 100.0, 100.0));
        assert_eq!(
            pointer.get(),
            PointerState {
                x: 100.0,
                y: 100.0,
                down: true
            }
        );
        assert!(arbiter.on_touch(UP, 0, 100.0, 100.0));
        assert!(!arbiter.is_captured(0));
        assert!(!pointer.get().down);

        // the next sequence starts fresh
        assert!(!arbiter.on_touch(DOWN, 0, 100.0, 100.0));
    }

    #[test]
    fn test_cancel_releases() {
        let (arbiter, _, _) = arbiter_with_window();
        assert!(arbiter.on_touch(DOWN, 0, 15.0, 15.0));
        assert!(arbiter.on_touch(CANCEL, 0, 15.0, 15.0));
        assert!(!arbiter.on_touch(MOVE, 0, 15.0, 15.0));
    }

    #[test]
    fn test_pointers_tracked_separately() {
        let (arbiter, _, _) = arbiter_with_window();
        assert!(arbiter.on_touch(DOWN, 0, 15.0, 15.0));
        assert!(!arbiter.on_touch(0x0105, 1, 200.0, 200.0));
        assert!(!arbiter.on_touch(MOVE, 1, 15.0, 15.0));
        assert!(arbiter.on_touch(MOVE, 0, 300.0, 300.0));
        assert!(!arbiter.on_touch(0x0106, 1, 15.0, 15.0));
        assert!(arbiter.on_touch(UP, 0, 300.0, 300.0));
    }

    #[test]
    fn test_hidden_window_never_captures() {
        let (arbiter, bounds, _) = arbiter_with_window();
        bounds.set_hidden(0);
        assert!(!arbiter.on_touch(DOWN, 0, 15.0, 15.0));
        assert!(!bounds.snapshot()[0].visible);
        // geometry is kept, only visibility changes
        assert_eq!(bounds.snapshot()[0].rect, WindowRect::new(10.0, 10.0, 20.0, 20.0));
    }

    #[test]
    fn test_out_of_range_window_ignored() {
        let bounds = BoundsTable::new(1);
        bounds.set_drawn(5, WindowRect::new(0.0, 0.0, 100.0, 100.0));
        bounds.set_hidden(5);
        assert!(!bounds.hit_test(1.0, 1.0));
    }
}
