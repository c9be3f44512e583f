//! Render suspension state.
//!
//! Each renderer owns one `RenderScheduler`. Suspensions nest; only leaving
//! the outermost one releases the deferred redraw.

#[derive(Debug, Default)]
pub struct RenderScheduler {
    depth: usize,
    deferred: u64,
}

impl RenderScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suspended(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn enter(&mut self) {
        self.depth += 1;
    }

    /// Leave one suspension level. Returns `true` when the outermost level
    /// was left and the caller owes exactly one redraw.
    pub(crate) fn exit(&mut self) -> bool {
        match self.depth {
            0 => false,
            1 => {
                self.depth = 0;
                self.deferred = 0;
                true
            }
            _ => {
                self.depth -= 1;
                false
            }
        }
    }

    /// Record a redraw that was skipped because rendering is suspended.
    pub(crate) fn defer(&mut self) {
        self.deferred += 1;
    }

    /// Redraws skipped since the current suspension began.
    pub fn deferred(&self) -> u64 {
        self.deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_exit_releases_once() {
        let mut s = RenderScheduler::new();
        s.enter();
        s.enter();
        s.defer();
        assert!(s.is_suspended());
        assert!(!s.exit());
        assert_eq!(s.deferred(), 1);
        assert!(s.exit());
        assert!(!s.is_suspended());
        assert_eq!(s.deferred(), 0);
    }

    #[test]
    fn test_exit_when_not_suspended() {
        let mut s = RenderScheduler::new();
        assert!(!s.exit());
        assert_eq!(s.depth(), 0);
    }
}
