use crate::types::TrackerState;

/// Fixed-size bit set indexed by logical feature index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitMask {
    words: Vec<u64>,
    len: usize,
}

impl BitMask {
    /// All bits cleared.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// All `len` bits set.
    pub fn full(len: usize) -> Self {
        let mut mask = Self::new(len);
        for i in 0..len {
            mask.set(i, true);
        }
        mask
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {} out of range ({})", index, self.len);
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "bit {} out of range ({})", index, self.len);
        let bit = 1u64 << (index % 64);
        if value {
            self.words[index / 64] |= bit;
        } else {
            self.words[index / 64] &= !bit;
        }
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }
}

/// Snapshot of every logical feature, indexed by logical index.
///
/// Sized once when the manager is finalized; never resized afterwards.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    trackers: Vec<TrackerState>,
    buttons: BitMask,
    valuators: Vec<f64>,
}

impl DeviceState {
    pub fn new(num_trackers: usize, num_buttons: usize, num_valuators: usize) -> Self {
        Self {
            trackers: vec![TrackerState::default(); num_trackers],
            buttons: BitMask::new(num_buttons),
            valuators: vec![0.0; num_valuators],
        }
    }

    pub fn num_trackers(&self) -> usize {
        self.trackers.len()
    }

    pub fn num_buttons(&self) -> usize {
        self.buttons.len()
    }

    pub fn num_valuators(&self) -> usize {
        self.valuators.len()
    }

    pub fn tracker(&self, index: usize) -> &TrackerState {
        &self.trackers[index]
    }

    pub fn trackers(&self) -> &[TrackerState] {
        &self.trackers
    }

    pub fn button(&self, index: usize) -> bool {
        self.buttons.get(index)
    }

    pub fn buttons(&self) -> &BitMask {
        &self.buttons
    }

    pub fn valuator(&self, index: usize) -> f64 {
        self.valuators[index]
    }

    pub fn valuators(&self) -> &[f64] {
        &self.valuators
    }

    pub(crate) fn set_tracker(&mut self, index: usize, state: TrackerState) {
        self.trackers[index] = state;
    }

    pub(crate) fn set_button(&mut self, index: usize, pressed: bool) {
        self.buttons.set(index, pressed);
    }

    pub(crate) fn set_valuator(&mut self, index: usize, value: f64) {
        self.valuators[index] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmask_spans_words() {
        let mut mask = BitMask::new(130);
        mask.set(0, true);
        mask.set(64, true);
        mask.set(129, true);
        assert_eq!(mask.count_ones(), 3);
        assert!(mask.get(129));
        assert!(!mask.get(128));

        mask.set(64, false);
        assert!(!mask.get(64));
        mask.clear();
        assert_eq!(mask.count_ones(), 0);
    }

    #[test]
    fn test_full_mask_equality() {
        let mut mask = BitMask::new(70);
        for i in 0..70 {
            assert_ne!(mask, BitMask::full(70));
            mask.set(i, true);
        }
        assert_eq!(mask, BitMask::full(70));
        assert_eq!(BitMask::new(0), BitMask::full(0));
    }

    #[test]
    fn test_device_state_defaults() {
        let state = DeviceState::new(2, 3, 1);
        assert_eq!(state.num_trackers(), 2);
        assert_eq!(state.num_buttons(), 3);
        assert!(!state.button(2));
        assert_eq!(state.valuator(0), 0.0);
    }
}
