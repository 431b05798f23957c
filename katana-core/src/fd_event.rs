// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Readiness event flags a registered fd can be subscribed to, and the
//! callback signature invoked when one fires.

bitflags::bitflags! {
    /// Readiness flags for a registered fd. Mirrors `fd_event.hpp`'s
    /// `event_type` bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventType: u8 {
        const READABLE      = 1 << 0;
        const WRITABLE      = 1 << 1;
        const EDGE_TRIGGERED = 1 << 2;
        const ERROR         = 1 << 3;
        const HUP           = 1 << 4;
        const ONESHOT       = 1 << 5;
    }
}

impl EventType {
    pub fn has(self, flag: EventType) -> bool {
        self.contains(flag)
    }
}

/// Callback invoked by the reactor when a registered fd becomes ready, or
/// when its timeout / graceful-shutdown force-close fires (with
/// [`EventType::ERROR`]).
pub type EventCallback = Box<dyn FnMut(EventType) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitwise_or_and_has_flag() {
        let mask = EventType::READABLE | EventType::EDGE_TRIGGERED;
        assert!(mask.has(EventType::READABLE));
        assert!(mask.has(EventType::EDGE_TRIGGERED));
        assert!(!mask.has(EventType::WRITABLE));
    }
}
