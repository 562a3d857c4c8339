//! Per-connection timer bookkeeping.
//!
//! Every connection owns a flat list of scheduled callbacks: retransmissions
//! (one per unacknowledged send slot), re-delivery attempts (one per refused
//! receive slot), at most one connect or disconnect deadline, and the
//! always-on window check. Timers reference their slot by ring index, never
//! by pointer, so a timer can outlive nothing - the sweep revalidates the
//! connection after every handler and a stale slot index simply misses.

/// Retry sentinel: the timer is rescheduled forever and only disappears when
/// cancelled explicitly (or the connection dies).
pub const RETRY_ALWAYS: u16 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Disconnect,
    Connect,
    Retransmit,
    Recv,
    WindowCheck,
}

/// What a timer is about. Slot contexts index into the connection's send or
/// receive ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerContext {
    None,
    SendSlot(usize),
    RecvSlot(usize),
}

#[derive(Debug)]
pub struct Timer {
    pub id: u64,
    pub kind: TimerKind,
    pub context: TimerContext,
    /// Absolute firing time in engine-clock milliseconds.
    pub when: u32,
    /// Reschedule period.
    pub delta: u32,
    pub retry: u16,
}

#[derive(Debug, Default)]
pub struct TimerList {
    next_id: u64,
    timers: Vec<Timer>,
}

impl TimerList {
    pub fn schedule(
        &mut self,
        kind: TimerKind,
        context: TimerContext,
        now: u32,
        delta: u32,
        retry: u16,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.push(Timer {
            id,
            kind,
            context,
            when: now.wrapping_add(delta),
            delta,
            retry,
        });
        id
    }

    /// Remove the first timer matching kind and context.
    pub fn cancel(&mut self, kind: TimerKind, context: TimerContext) -> bool {
        if let Some(pos) = self
            .timers
            .iter()
            .position(|t| t.kind == kind && t.context == context)
        {
            self.timers.swap_remove(pos);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: u64) {
        if let Some(pos) = self.timers.iter().position(|t| t.id == id) {
            self.timers.swap_remove(pos);
        }
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Timer> {
        self.timers.iter_mut().find(|t| t.id == id)
    }

    pub fn find_mut(&mut self, kind: TimerKind, context: TimerContext) -> Option<&mut Timer> {
        self.timers
            .iter_mut()
            .find(|t| t.kind == kind && t.context == context)
    }

    /// First timer due at `now`, if any. The sweep fires it, then either
    /// removes or reschedules it, so repeated calls make progress.
    pub fn peek_due(&self, now: u32) -> Option<(u64, TimerKind, TimerContext)> {
        self.timers
            .iter()
            .find(|t| t.when.wrapping_sub(now) as i32 <= 0)
            .map(|t| (t.id, t.kind, t.context))
    }

    /// Post-fire bookkeeping: a timer whose retries are used up is dropped,
    /// anything else is rescheduled one period out. The sentinel
    /// [`RETRY_ALWAYS`] never reaches zero, so such timers run until
    /// cancelled.
    pub fn after_fire(&mut self, id: u64, now: u32) {
        if let Some(pos) = self.timers.iter().position(|t| t.id == id) {
            if self.timers[pos].retry == 0 {
                self.timers.swap_remove(pos);
            } else {
                let timer = &mut self.timers[pos];
                timer.when = now.wrapping_add(timer.delta);
            }
        }
    }

    /// Earliest deadline across all scheduled timers.
    pub fn next_deadline(&self) -> Option<u32> {
        self.timers
            .iter()
            .map(|t| t.when)
            .min_by_key(|&when| when)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_peek() {
        let mut timers = TimerList::default();
        timers.schedule(TimerKind::Retransmit, TimerContext::SendSlot(2), 100, 500, 5);
        timers.schedule(TimerKind::WindowCheck, TimerContext::None, 100, 50, RETRY_ALWAYS);

        assert_eq!(timers.peek_due(100), None);
        let (_, kind, ctx) = timers.peek_due(150).unwrap();
        assert_eq!(kind, TimerKind::WindowCheck);
        assert_eq!(ctx, TimerContext::None);
    }

    #[test]
    fn test_cancel_first_match_only() {
        let mut timers = TimerList::default();
        timers.schedule(TimerKind::Retransmit, TimerContext::SendSlot(1), 0, 500, 5);
        timers.schedule(TimerKind::Retransmit, TimerContext::SendSlot(2), 0, 500, 5);

        assert!(timers.cancel(TimerKind::Retransmit, TimerContext::SendSlot(2)));
        assert!(!timers.cancel(TimerKind::Retransmit, TimerContext::SendSlot(2)));
        assert_eq!(timers.len(), 1);
        assert!(timers.cancel(TimerKind::Retransmit, TimerContext::SendSlot(1)));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_next_deadline() {
        let mut timers = TimerList::default();
        assert_eq!(timers.next_deadline(), None);

        timers.schedule(TimerKind::Connect, TimerContext::None, 0, 10_000, 0);
        timers.schedule(TimerKind::Retransmit, TimerContext::SendSlot(0), 0, 500, 5);
        assert_eq!(timers.next_deadline(), Some(500));
    }

    #[test]
    fn test_accelerated_timer_is_due() {
        let mut timers = TimerList::default();
        let id = timers.schedule(TimerKind::Retransmit, TimerContext::SendSlot(0), 1000, 500, 5);

        // fast retransmit pulls the deadline backwards
        let timer = timers.get_mut(id).unwrap();
        timer.when = timer.when.wrapping_sub(timer.delta);

        assert!(timers.peek_due(1000).is_some());
    }
}
