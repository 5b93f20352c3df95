use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the agent and of the relay loop. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkingStatus {
    Starting = 0,
    Working = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkingStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkingStatus::Starting,
            1 => WorkingStatus::Working,
            2 => WorkingStatus::Stopping,
            _ => WorkingStatus::Stopped,
        }
    }

    pub fn is_running(self) -> bool {
        self <= WorkingStatus::Working
    }
}

impl std::fmt::Display for WorkingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkingStatus::Starting => "starting",
            WorkingStatus::Working => "working",
            WorkingStatus::Stopping => "stopping",
            WorkingStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(WorkingStatus::Starting as u8))
    }

    pub fn get(&self) -> WorkingStatus {
        WorkingStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.get().is_running()
    }

    /// Move to `to` unless already past it. Returns the previous status.
    pub fn advance(&self, to: WorkingStatus) -> WorkingStatus {
        WorkingStatus::from_u8(self.0.fetch_max(to as u8, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_moves_backwards() {
        let s = StatusCell::new();
        assert_eq!(s.get(), WorkingStatus::Starting);
        assert_eq!(s.advance(WorkingStatus::Working), WorkingStatus::Starting);
        assert_eq!(s.advance(WorkingStatus::Stopping), WorkingStatus::Working);
        assert_eq!(s.advance(WorkingStatus::Working), WorkingStatus::Stopping);
        assert_eq!(s.get(), WorkingStatus::Stopping);
        assert!(!s.is_running());
        s.advance(WorkingStatus::Stopped);
        s.advance(WorkingStatus::Starting);
        assert_eq!(s.get(), WorkingStatus::Stopped);
    }
}
