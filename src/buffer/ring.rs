//! Fixed-capacity ring of equally sized columns.
//!
//! One column holds one time step for every module. Storage is a single flat
//! allocation made at construction; pushing never reallocates.
//!
//! # Memory Layout
//! ```text
//! data: [col 0 | col 1 | ... | col capacity-1]   each col = width values
//! head: total columns ever pushed (monotonic)
//! newest column lives at slot (head - 1) % capacity
//! ```

/// Circular column store with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct ColumnRing<T> {
    data: Vec<T>,
    width: usize,
    capacity: usize,
    head: u64,
}

impl<T: Copy + Default> ColumnRing<T> {
    /// Ring of `capacity` columns, each `width` values wide.
    pub fn new(capacity: usize, width: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![T::default(); capacity * width],
            width,
            capacity,
            head: 0,
        }
    }

    /// Values per column.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Maximum number of columns held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Columns currently held.
    pub fn len(&self) -> usize {
        self.head.min(self.capacity as u64) as usize
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    /// Whether the next push evicts a column.
    pub fn is_full(&self) -> bool {
        self.head >= self.capacity as u64
    }

    /// Columns pushed since construction or the last `clear`.
    pub fn total_pushed(&self) -> u64 {
        self.head
    }

    fn slot(&self, position: u64) -> std::ops::Range<usize> {
        let start = (position % self.capacity as u64) as usize * self.width;
        start..start + self.width
    }

    /// Column `age` steps back from the newest (0 = newest).
    pub fn get(&self, age: usize) -> Option<&[T]> {
        if age >= self.len() {
            return None;
        }
        let position = self.head - 1 - age as u64;
        Some(&self.data[self.slot(position)])
    }

    /// Oldest held column.
    pub fn oldest(&self) -> Option<&[T]> {
        self.len().checked_sub(1).and_then(|age| self.get(age))
    }

    /// The column the next push will overwrite, if the ring is full.
    ///
    /// Lets callers retire the evicted values before they are lost.
    pub fn next_evicted(&self) -> Option<&[T]> {
        if self.is_full() {
            self.oldest()
        } else {
            None
        }
    }

    /// Append a column, evicting the oldest when full.
    ///
    /// `column` shorter than `width` is zero-extended; extra values are ignored.
    pub fn push(&mut self, column: &[T]) {
        let range = self.slot(self.head);
        let dst = &mut self.data[range];
        let n = column.len().min(dst.len());
        dst[..n].copy_from_slice(&column[..n]);
        dst[n..].fill(T::default());
        self.head += 1;
    }

    /// Iterate held columns oldest first.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = &[T]> + '_ {
        (0..self.len()).rev().filter_map(move |age| self.get(age))
    }

    /// Drop all columns.
    pub fn clear(&mut self) {
        self.data.fill(T::default());
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_get() {
        let mut ring = ColumnRing::<u16>::new(3, 2);
        assert!(ring.is_empty());
        ring.push(&[1, 10]);
        ring.push(&[2, 20]);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get(0), Some(&[2, 20][..]));
        assert_eq!(ring.get(1), Some(&[1, 10][..]));
        assert_eq!(ring.get(2), None);
        assert_eq!(ring.next_evicted(), None);
    }

    #[test]
    fn test_circular_wrap() {
        let mut ring = ColumnRing::<u32>::new(3, 1);
        for v in 1..=3 {
            ring.push(&[v]);
        }
        assert!(ring.is_full());
        assert_eq!(ring.next_evicted(), Some(&[1][..]));
        ring.push(&[4]);
        ring.push(&[5]);
        assert_eq!(ring.len(), 3);
        let held: Vec<u32> = ring.iter_oldest_first().map(|c| c[0]).collect();
        assert_eq!(held, vec![3, 4, 5]);
        assert_eq!(ring.oldest(), Some(&[3][..]));
        assert_eq!(ring.total_pushed(), 5);
    }

    #[test]
    fn test_short_column_zero_extends() {
        let mut ring = ColumnRing::<u16>::new(1, 3);
        ring.push(&[7, 7, 7]);
        ring.push(&[9]);
        assert_eq!(ring.get(0), Some(&[9, 0, 0][..]));
    }

    #[test]
    fn test_clear() {
        let mut ring = ColumnRing::<u16>::new(2, 2);
        ring.push(&[1, 1]);
        ring.push(&[2, 2]);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.oldest(), None);
        ring.push(&[3, 3]);
        assert_eq!(ring.len(), 1);
    }
}
