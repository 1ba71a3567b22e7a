//! Single-occupancy completion cells bridging transport callbacks to waiters.

use std::sync::Mutex;

use futures_channel::oneshot;

use crate::error::ErrorKind;
use crate::{Error, Result};

/// A completion cell for one operation kind.
///
/// At most one waiter may be armed at a time, mirroring the transport's
/// one-outstanding-operation-per-kind contract. Arming while occupied fails
/// with [`ErrorKind::OperationInProgress`]; resolving or rejecting a vacant
/// slot is a no-op, which makes late or duplicate transport callbacks
/// harmless.
pub(crate) struct Slot<T> {
    cell: Mutex<Option<oneshot::Sender<Result<T>>>>,
}

/// The waiter half produced by [`Slot::arm`].
pub(crate) struct Pending<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Slot {
            cell: Mutex::new(None),
        }
    }

    /// Occupies the slot and returns the waiter half.
    ///
    /// A previous waiter that was dropped without resolution (a cancelled
    /// caller) does not count as occupancy and is reclaimed here.
    pub fn arm(&self) -> Result<Pending<T>> {
        let mut cell = self.cell.lock().unwrap();
        if cell.as_ref().is_some_and(|sender| !sender.is_canceled()) {
            return Err(ErrorKind::OperationInProgress.into());
        }
        let (sender, receiver) = oneshot::channel();
        *cell = Some(sender);
        Ok(Pending { receiver })
    }

    /// Completes the armed waiter with `value`. Returns false if the slot was
    /// vacant or the waiter has gone away.
    pub fn resolve(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Fails the armed waiter with `error`. Returns false if the slot was
    /// vacant or the waiter has gone away.
    pub fn reject(&self, error: Error) -> bool {
        self.finish(Err(error))
    }

    fn finish(&self, result: Result<T>) -> bool {
        match self.cell.lock().unwrap().take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }
}

impl<T> Pending<T> {
    /// Suspends until the slot is resolved or rejected.
    ///
    /// If the slot is torn down without a resolution the wait reports
    /// [`ErrorKind::ConnectionLost`].
    pub async fn wait(self) -> Result<T> {
        match self.receiver.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(Error::new(
                ErrorKind::ConnectionLost,
                None,
                "completion cell dropped before resolution".to_string(),
            )),
        }
    }
}
