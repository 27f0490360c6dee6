use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Watchdog-driven reliable bulk fetch of the vehicle's parameter set.
///
/// `slots` holds the ordered view (index -> last-known value, `None` while
/// unknown); `by_id` is the keyed mapping, updated unconditionally from every
/// `PARAM_VALUE` regardless of whether its index is still in range.
pub struct ParamSet {
    slots: Vec<Option<f32>>,
    by_id: HashMap<String, f32>,
    started: bool,
    loaded: bool,
    last_new_slot: Instant,
    duration: Duration,
    start_duration: Duration,
    repeat_duration: Duration,
}

impl ParamSet {
    pub fn new(start_duration: Duration, repeat_duration: Duration) -> Self {
        Self {
            slots: Vec::new(),
            by_id: HashMap::new(),
            started: false,
            loaded: false,
            last_new_slot: Instant::now(),
            duration: start_duration,
            start_duration,
            repeat_duration,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, param_id: &str) -> Option<f32> {
        self.by_id.get(param_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, f32> {
        self.by_id.clone()
    }

    /// Apply dispatch-pipeline step 1 (§4.D.3) for an inbound `PARAM_VALUE`.
    pub fn on_param_value(
        &mut self,
        param_id: &str,
        param_value: f32,
        param_index: u16,
        param_count: u16,
    ) {
        if param_count as usize != self.slots.len() {
            self.slots = vec![None; param_count as usize];
            self.started = true;
            self.loaded = false;
        }

        let index = param_index as usize;
        if index < self.slots.len() && self.slots[index].is_none() {
            self.slots[index] = Some(param_value);
            self.last_new_slot = Instant::now();
            self.duration = self.start_duration;
        }

        self.by_id.insert(param_id.to_string(), param_value);

        if self.started && !self.slots.iter().any(Option::is_none) {
            self.loaded = true;
        }
    }

    /// Parameter watchdog (loop step 1). Returns the (up to 50) indices to
    /// re-request via `PARAM_REQUEST_READ` if the watchdog fires, or `None`
    /// if it is not yet due / there is nothing missing.
    pub fn watchdog_tick(&mut self, now: Instant) -> Option<Vec<u16>> {
        if !self.started || self.loaded {
            return None;
        }
        if now.duration_since(self.last_new_slot) <= self.duration {
            return None;
        }

        let missing: Vec<u16> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| if slot.is_none() { Some(i as u16) } else { None })
            .take(50)
            .collect();

        self.duration = self.repeat_duration;
        self.last_new_slot = now;

        Some(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> ParamSet {
        ParamSet::new(Duration::from_millis(200), Duration::from_secs(1))
    }

    #[test]
    fn new_count_allocates_unknown_slots_and_resets_loaded() {
        let mut p = set();
        p.on_param_value("THR_MIN", 1.0, 0, 3);
        assert!(p.started());
        assert!(!p.loaded());
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn loaded_true_iff_no_unknown_slot_remains() {
        let mut p = set();
        p.on_param_value("A", 1.0, 0, 2);
        assert!(!p.loaded());
        p.on_param_value("B", 2.0, 1, 2);
        assert!(p.loaded());
    }

    #[test]
    fn distinct_param_count_resets_all_slots() {
        let mut p = set();
        p.on_param_value("A", 1.0, 0, 3);
        p.on_param_value("B", 2.0, 1, 3);
        p.on_param_value("C", 3.0, 2, 3);
        assert!(p.loaded());

        p.on_param_value("A", 9.0, 0, 5);
        assert!(!p.loaded());
        assert_eq!(p.len(), 5);
        assert_eq!(p.get("A"), Some(9.0));
    }

    #[test]
    fn keyed_mapping_always_updated_even_out_of_range_index() {
        let mut p = set();
        p.on_param_value("A", 1.0, 0, 1);
        // index 5 is out of range for a count-1 set, but by_id still updates.
        p.on_param_value("B", 2.0, 5, 1);
        assert_eq!(p.get("B"), Some(2.0));
    }

    #[test]
    fn latest_value_wins_in_keyed_mapping() {
        let mut p = set();
        p.on_param_value("A", 1.0, 0, 1);
        p.on_param_value("A", 2.0, 0, 1);
        assert_eq!(p.get("A"), Some(2.0));
    }

    #[test]
    fn watchdog_does_not_fire_before_duration_elapses() {
        let mut p = set();
        p.on_param_value("A", 1.0, 0, 3);
        assert!(p.watchdog_tick(Instant::now()).is_none());
    }

    #[test]
    fn watchdog_never_fires_for_a_fully_received_set() {
        let mut p = set();
        p.on_param_value("A", 1.0, 0, 1);
        assert!(p.loaded());
        std::thread::sleep(Duration::from_millis(260));
        assert!(p.watchdog_tick(Instant::now()).is_none());
    }

    #[test]
    fn watchdog_reports_missing_indices_after_gap() {
        let mut p = set();
        p.on_param_value("A", 1.0, 0, 3);
        p.on_param_value("C", 3.0, 2, 3);
        std::thread::sleep(Duration::from_millis(220));
        let missing = p.watchdog_tick(Instant::now()).expect("watchdog should fire");
        assert_eq!(missing, vec![1]);

        p.on_param_value("B", 2.0, 1, 3);
        assert!(p.loaded());
    }
}
