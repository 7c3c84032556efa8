use core::{cell::RefCell, future::poll_fn, task::Poll};

use embassy_sync::{
    blocking_mutex::{Mutex, raw::RawMutex},
    waitqueue::MultiWakerRegistration,
};

struct Slot<T, const W: usize> {
    value: Option<T>,
    waiters: MultiWakerRegistration<W>,
}

/// A value written once and read any number of times. The first `resolve`
/// wins, later ones are ignored.
pub(crate) struct OneShot<M: RawMutex, T: Copy, const W: usize = 4> {
    slot: Mutex<M, RefCell<Slot<T, W>>>,
}

impl<M: RawMutex, T: Copy, const W: usize> OneShot<M, T, W> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: Mutex::new(RefCell::new(Slot {
                value: None,
                waiters: MultiWakerRegistration::new(),
            })),
        }
    }

    /// Returns false if a value was already set.
    pub(crate) fn resolve(&self, value: T) -> bool {
        self.slot.lock(|slot| {
            let mut slot = slot.borrow_mut();

            if slot.value.is_some() {
                return false;
            }

            slot.value = Some(value);
            slot.waiters.wake();
            true
        })
    }

    pub(crate) fn get(&self) -> Option<T> {
        self.slot.lock(|slot| slot.borrow().value)
    }

    pub(crate) fn reset(&self) {
        self.slot.lock(|slot| slot.borrow_mut().value = None);
    }

    pub(crate) async fn wait(&self) -> T {
        poll_fn(|cx| {
            self.slot.lock(|slot| {
                let mut slot = slot.borrow_mut();

                match slot.value {
                    Some(value) => Poll::Ready(value),
                    None => {
                        slot.waiters.register(cx.waker());
                        Poll::Pending
                    }
                }
            })
        })
        .await
    }
}
