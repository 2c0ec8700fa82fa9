//! Single-slot armed timer
//!
//! Holds at most one deadline. Arming replaces whatever was armed before, and a
//! fired or disarmed timer leaves the slot empty. The deadline type is generic
//! so the same slot works on the wall clock (`Instant`) and on the audio sample
//! clock (`u64` sample positions).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

#[derive(Debug, Clone, Copy)]
struct Armed<T> {
    deadline: T,
    token: TimerToken,
}

#[derive(Debug, Clone)]
pub struct TimerSlot<T> {
    armed: Option<Armed<T>>,
    next_token: u64,
}

impl<T> Default for TimerSlot<T> {
    fn default() -> Self {
        Self {
            armed: None,
            next_token: 0,
        }
    }
}

impl<T: Copy + PartialOrd> TimerSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot, invalidating any previous deadline
    pub fn arm(&mut self, deadline: T) -> TimerToken {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.armed = Some(Armed { deadline, token });
        token
    }

    /// Returns whether a deadline was pending
    pub fn disarm(&mut self) -> bool {
        self.armed.take().is_some()
    }

    pub fn deadline(&self) -> Option<T> {
        self.armed.map(|a| a.deadline)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Number of live timers; never more than one
    pub fn live(&self) -> usize {
        usize::from(self.armed.is_some())
    }

    /// Whether `token` is the deadline currently armed
    pub fn is_current(&self, token: TimerToken) -> bool {
        self.armed.map(|a| a.token == token).unwrap_or(false)
    }

    /// Fire the armed deadline if `now` has reached it, emptying the slot
    pub fn fire_if_due(&mut self, now: T) -> Option<TimerToken> {
        match self.armed {
            Some(armed) if now >= armed.deadline => {
                self.armed = None;
                Some(armed.token)
            }
            _ => None,
        }
    }
}
