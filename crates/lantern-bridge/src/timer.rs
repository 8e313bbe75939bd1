use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use mlua::{Function, Lua, RegistryKey};
use tracing::warn;

use crate::binding::load_portable;

/// Unique identifier for a timed event, as seen by scripts
pub type TimedEventId = u32;

/// A script callback scheduled on the bridge clock
#[derive(Debug)]
struct TimedEvent {
    callback: Rc<RegistryKey>,
    delay: Duration,
    /// Calls left; `None` repeats forever
    remaining: Option<u32>,
    next_fire: Duration,
    /// Chunk the callback was restored from after a reload
    carried: Option<Vec<u8>>,
}

impl TimedEvent {
    /// Out of calls, waiting to be claimed or purged
    fn is_spent(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// A timed event that came due during a tick
#[derive(Debug, Clone)]
pub struct FiredEvent {
    pub id: TimedEventId,
    pub callback: Rc<RegistryKey>,
    pub delay_ms: u32,
    /// Calls left after this one, 0 for unlimited
    pub remaining: u32,
}

/// A timed event carried across a reload
#[derive(Debug, Clone)]
pub struct PortableTimer {
    pub chunk: Vec<u8>,
    pub delay: Duration,
    pub remaining: Option<u32>,
    pub due_in: Duration,
}

/// Manages timed events for scripts.
///
/// Time only advances through [`TimedEventManager::tick`], so scheduling is
/// deterministic with respect to the host's update loop.
#[derive(Debug, Default)]
pub struct TimedEventManager {
    events: BTreeMap<TimedEventId, TimedEvent>,
    next_id: TimedEventId,
    now: Duration,
}

impl TimedEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback` every `delay`, `repeats` times (0 repeats forever)
    pub fn schedule(&mut self, callback: RegistryKey, delay: Duration, repeats: u32) -> TimedEventId {
        self.insert(callback, delay, (repeats != 0).then_some(repeats), delay, None)
    }

    fn insert(
        &mut self,
        callback: RegistryKey,
        delay: Duration,
        remaining: Option<u32>,
        due_in: Duration,
        carried: Option<Vec<u8>>,
    ) -> TimedEventId {
        self.next_id += 1;
        let id = self.next_id;
        self.events.insert(
            id,
            TimedEvent {
                callback: Rc::new(callback),
                delay,
                remaining,
                next_fire: self.now + due_in,
                carried,
            },
        );
        id
    }

    pub fn cancel(&mut self, id: TimedEventId) -> bool {
        self.events.remove(&id).is_some()
    }

    /// Cancel everything; returns how many events were pending
    pub fn clear(&mut self) -> usize {
        let count = self.active_count();
        self.events.clear();
        count
    }

    pub fn active_count(&self) -> usize {
        self.events.values().filter(|event| !event.is_spent()).count()
    }

    /// Advance the clock by `diff` and collect the events that came due.
    ///
    /// Each event fires at most once per tick. An event on its last call stays
    /// scheduled until [`TimedEventManager::take_due`] claims it, so callbacks
    /// fired earlier in the same tick can still cancel it.
    pub fn tick(&mut self, diff: Duration) -> Vec<FiredEvent> {
        self.events.retain(|_, event| !event.is_spent());
        self.now += diff;
        let now = self.now;

        let mut due: Vec<(Duration, TimedEventId)> = self
            .events
            .iter()
            .filter(|(_, event)| event.next_fire <= now)
            .map(|(id, event)| (event.next_fire, *id))
            .collect();
        due.sort();

        let mut fired = Vec::with_capacity(due.len());
        for (_, id) in due {
            let Some(event) = self.events.get_mut(&id) else {
                continue;
            };
            let remaining = match event.remaining.as_mut() {
                Some(left) => {
                    *left -= 1;
                    *left
                }
                None => 0,
            };
            event.next_fire = now + event.delay;

            fired.push(FiredEvent {
                id,
                callback: event.callback.clone(),
                delay_ms: u32::try_from(event.delay.as_millis()).unwrap_or(u32::MAX),
                remaining,
            });
        }
        fired
    }

    /// Claim a fired event right before running it.
    ///
    /// Returns false when the event was cancelled after it came due. An event
    /// on its last call is removed.
    pub fn take_due(&mut self, id: TimedEventId) -> bool {
        match self.events.get(&id) {
            Some(event) if event.is_spent() => {
                self.events.remove(&id);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Capture pending script callbacks as compiled chunks
    pub fn snapshot(&self, lua: &Lua) -> Vec<PortableTimer> {
        let mut timers = Vec::new();
        for (id, event) in self.events.iter().filter(|(_, event)| !event.is_spent()) {
            let chunk = lua
                .registry_value::<Function>(&event.callback)
                .map(|func| func.dump(false))
                .unwrap_or_default();
            if chunk.is_empty() {
                warn!(target: "scripting", "Dropping timed event {}: callback cannot be carried across a reload", id);
                continue;
            }
            timers.push(PortableTimer {
                chunk,
                delay: event.delay,
                remaining: event.remaining,
                due_in: event.next_fire.saturating_sub(self.now),
            });
        }
        timers
    }

    /// Reschedule captured timers in `lua`; returns how many were restored
    pub fn restore(&mut self, lua: &Lua, timers: Vec<PortableTimer>) -> usize {
        let mut restored = 0;
        for timer in timers {
            let key = load_portable(lua, timer.chunk.clone(), "timed event")
                .and_then(|func| lua.create_registry_value(func));
            match key {
                Ok(key) => {
                    self.insert(key, timer.delay, timer.remaining, timer.due_in, Some(timer.chunk));
                    restored += 1;
                }
                Err(e) => warn!(target: "scripting", "Failed to restore timed event: {}", e),
            }
        }
        restored
    }

    /// Drop restored events that the scripts scheduled again.
    ///
    /// A fresh event with the same delay and the same dumped callback takes
    /// over the restored event's due time and remaining calls. Returns how many
    /// restored events were dropped.
    pub fn retire_replaced(&mut self, lua: &Lua) -> usize {
        let carried: Vec<TimedEventId> = self
            .events
            .iter()
            .filter(|(_, event)| event.carried.is_some())
            .map(|(id, _)| *id)
            .collect();
        if carried.is_empty() {
            return 0;
        }

        let mut fresh: Vec<(TimedEventId, Duration, Vec<u8>)> = self
            .events
            .iter()
            .filter(|(_, event)| event.carried.is_none() && !event.is_spent())
            .filter_map(|(id, event)| {
                let func = lua.registry_value::<Function>(&event.callback).ok()?;
                Some((*id, event.delay, func.dump(false)))
            })
            .collect();

        let mut retired = 0;
        for id in carried {
            let Some(old) = self.events.get(&id) else {
                continue;
            };
            let Some(pos) = fresh.iter().position(|(_, delay, chunk)| {
                *delay == old.delay && old.carried.as_ref() == Some(chunk)
            }) else {
                continue;
            };
            let (successor, _, _) = fresh.swap_remove(pos);
            let Some(old) = self.events.remove(&id) else {
                continue;
            };
            if let Some(event) = self.events.get_mut(&successor) {
                event.next_fire = old.next_fire;
                event.remaining = old.remaining;
            }
            retired += 1;
        }
        retired
    }
}
