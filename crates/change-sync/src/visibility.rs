use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityChange {
    Hidden,
    Resumed,
    Unchanged,
}

/// Process-wide foreground flag consulted before events or poll results are
/// let through. Starts visible.
#[derive(Debug)]
pub struct VisibilityGate {
    visible: AtomicBool,
}

impl Default for VisibilityGate {
    fn default() -> Self {
        Self {
            visible: AtomicBool::new(true),
        }
    }
}

impl VisibilityGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permits_delivery(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn visibility(&self) -> Visibility {
        if self.permits_delivery() {
            Visibility::Visible
        } else {
            Visibility::Hidden
        }
    }

    pub fn set(&self, visibility: Visibility) -> VisibilityChange {
        let visible = visibility == Visibility::Visible;
        let was_visible = self.visible.swap(visible, Ordering::SeqCst);
        let change = match (was_visible, visible) {
            (true, false) => VisibilityChange::Hidden,
            (false, true) => VisibilityChange::Resumed,
            _ => VisibilityChange::Unchanged,
        };
        if change != VisibilityChange::Unchanged {
            info!(target = "sync.visibility", ?change, "visibility changed");
        }
        change
    }
}
