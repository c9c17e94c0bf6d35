use crate::Checkpoint;

/// Dependency generations gathered at read time, in a fixed order chosen by
/// the owning model. Two stamps are equal iff no dependency mutated in
/// between, so a stamp equality check is enough to prove freshness.
pub(crate) type Stamp = Vec<u64>;

/// A memoized value with a generation stamp and one checkpoint slot.
///
/// `read` recomputes only when the stamp moved; `store`/`restore` snapshot
/// the pair, so a rejected proposal that never touched the dependencies
/// rolls back to the bit-exact cached state without recomputation. When a
/// dependency did move, the restored stamp mismatches and the next read
/// recomputes from the (also restored) inputs, reproducing the same values.
pub(crate) struct Memo<T> {
    value: T,
    stamp: Option<Stamp>,
    saved: Option<(T, Option<Stamp>)>,
}

impl<T: Clone> Memo<T> {
    pub(crate) fn new(initial: T) -> Self {
        Self {
            value: initial,
            stamp: None,
            saved: None,
        }
    }

    pub(crate) fn read(&mut self, stamp: Stamp, recompute: impl FnOnce(&mut T)) -> &T {
        if self.stamp.as_ref() != Some(&stamp) {
            recompute(&mut self.value);
            self.stamp = Some(stamp);
        }
        &self.value
    }
}

impl<T: Clone> Checkpoint for Memo<T> {
    fn store(&mut self) {
        self.saved = Some((self.value.clone(), self.stamp.clone()));
    }

    fn restore(&mut self) {
        let (value, stamp) = self
            .saved
            .take()
            .expect("restore without a preceding store");
        self.value = value;
        self.stamp = stamp;
    }

    fn accept(&mut self) {
        self.saved = None;
    }
}
