//! Restartable iteration over collections that may change concurrently.
//!
//! Pads of an element and children of a bin can be added or removed while
//! another thread walks them. [`Iter`] remembers the collection's change
//! cookie; when the collection changed under it, the next item is an
//! [`IterError::Resync`] and the caller decides whether to restart with
//! [`Iter::resync`].
//!
//! ```rust,ignore
//! let names: Vec<String> = element
//!     .iterate_pads()
//!     .collect_with_retry(16)?
//!     .into_iter()
//!     .map(|p| p.name().to_string())
//!     .collect();
//! ```

use thiserror::Error;

/// Failure while iterating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IterError {
    /// The collection changed; call [`Iter::resync`] and start over.
    #[error("collection changed during iteration")]
    Resync,

    /// The collection kept changing.
    #[error("collection changed {0} times during iteration")]
    TooManyResyncs(usize),
}

type Snapshot<T> = Box<dyn FnMut() -> (u32, Vec<T>) + Send>;
type Cookie = Box<dyn Fn() -> u32 + Send>;

/// Lazy, cookie-checked iterator.
pub struct Iter<T> {
    snapshot: Snapshot<T>,
    cookie: Cookie,
    state: Option<(u32, std::vec::IntoIter<T>)>,
}

impl<T> Iter<T> {
    /// Create an iterator.
    ///
    /// `snapshot` returns the current cookie together with the items;
    /// `cookie` returns the current cookie only.
    pub fn new(
        snapshot: impl FnMut() -> (u32, Vec<T>) + Send + 'static,
        cookie: impl Fn() -> u32 + Send + 'static,
    ) -> Self {
        Self {
            snapshot: Box::new(snapshot),
            cookie: Box::new(cookie),
            state: None,
        }
    }

    /// Iterator over a fixed list.
    pub fn from_vec(items: Vec<T>) -> Self
    where
        T: Clone + Send + 'static,
    {
        Self::new(move || (0, items.clone()), || 0)
    }

    /// Restart from the beginning of the current collection.
    pub fn resync(&mut self) {
        self.state = None;
    }

    /// Collect all items, restarting up to `max_resyncs` times.
    pub fn collect_with_retry(mut self, max_resyncs: usize) -> Result<Vec<T>, IterError> {
        let mut resyncs = 0;
        loop {
            match self.by_ref().collect::<Result<Vec<T>, IterError>>() {
                Err(IterError::Resync) => {
                    resyncs += 1;
                    if resyncs > max_resyncs {
                        return Err(IterError::TooManyResyncs(max_resyncs));
                    }
                    self.resync();
                }
                other => return other,
            }
        }
    }

    /// Find the first item matching `pred`, restarting up to `max_resyncs` times.
    pub fn find_with_retry(
        mut self,
        max_resyncs: usize,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Result<Option<T>, IterError> {
        let mut resyncs = 0;
        loop {
            match self.find(|item| !matches!(item, Ok(v) if !pred(v))) {
                None => return Ok(None),
                Some(Ok(v)) => return Ok(Some(v)),
                Some(Err(IterError::Resync)) => {
                    resyncs += 1;
                    if resyncs > max_resyncs {
                        return Err(IterError::TooManyResyncs(max_resyncs));
                    }
                    self.resync();
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }
}

impl<T> Iterator for Iter<T> {
    type Item = Result<T, IterError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state.is_none() {
            let (cookie, items) = (self.snapshot)();
            self.state = Some((cookie, items.into_iter()));
        }
        let current = (self.cookie)();
        let (cookie, items) = self.state.as_mut()?;
        if current != *cookie {
            return Some(Err(IterError::Resync));
        }
        items.next().map(Ok)
    }
}

impl<T> std::fmt::Debug for Iter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("started", &self.state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn shared(items: Vec<u32>) -> (Arc<Mutex<(u32, Vec<u32>)>>, Iter<u32>) {
        let data = Arc::new(Mutex::new((0, items)));
        let snap = Arc::clone(&data);
        let cookie = Arc::clone(&data);
        let iter = Iter::new(
            move || {
                let guard = snap.lock().unwrap();
                (guard.0, guard.1.clone())
            },
            move || cookie.lock().unwrap().0,
        );
        (data, iter)
    }

    #[test]
    fn test_plain_iteration() {
        let (_, iter) = shared(vec![1, 2, 3]);
        assert_eq!(iter.collect_with_retry(0).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_resync_signal() {
        let (data, mut iter) = shared(vec![1, 2]);
        assert_eq!(iter.next(), Some(Ok(1)));

        {
            let mut guard = data.lock().unwrap();
            guard.0 += 1;
            guard.1.push(3);
        }
        assert_eq!(iter.next(), Some(Err(IterError::Resync)));

        iter.resync();
        let rest: Vec<_> = iter.map(Result::unwrap).collect();
        assert_eq!(rest, vec![1, 2, 3]);
    }

    #[test]
    fn test_too_many_resyncs() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        // Every cookie check sees a new value
        let iter = Iter::new(|| (u32::MAX, vec![1u32]), move || c.fetch_add(1, Ordering::SeqCst));
        assert_eq!(
            iter.collect_with_retry(16),
            Err(IterError::TooManyResyncs(16))
        );
    }

    #[test]
    fn test_find_with_retry() {
        let (_, iter) = shared(vec![4, 7, 9]);
        assert_eq!(iter.find_with_retry(1, |v| *v > 5).unwrap(), Some(7));
        let (_, iter) = shared(vec![4]);
        assert_eq!(iter.find_with_retry(1, |v| *v > 5).unwrap(), None);
    }
}
