// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_channel::{Recv, Send, TryRecvError, TrySendError};

/// AsyncQueue is a thin wrapper of async_channel.
#[derive(Clone)]
pub struct AsyncQueue<M> {
    receiver: async_channel::Receiver<M>,
    sender: async_channel::Sender<M>,
}

impl<M> Default for AsyncQueue<M> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<M> AsyncQueue<M> {
    pub fn unbounded() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self { receiver, sender }
    }

    /// A queue holding at most `cap` items; senders suspend when full.
    pub fn bounded(cap: usize) -> Self {
        let (sender, receiver) = async_channel::bounded(cap);
        Self { receiver, sender }
    }

    pub fn send(&self, msg: M) -> Send<'_, M> {
        self.sender.send(msg)
    }

    pub fn try_send(&self, msg: M) -> Result<(), TrySendError<M>> {
        self.sender.try_send(msg)
    }

    pub fn recv(&self) -> Recv<'_, M> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Closes the queue, waking any pending receiver with an error.
    pub fn close(&self) {
        self.receiver.close();
    }
}
