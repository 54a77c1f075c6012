//! Flow bridge - bidirectional splice with coordinated shutdown
//!
//! Each NAT-ed TCP session bridges two byte streams: `up` toward the origin
//! and `down` toward the host kernel. The two splice directions run as
//! independent tasks; when a side sees EOF or an error it shuts the
//! opposite write half and counts the shutdown latch down. A watcher task
//! waits for both and pulls the flow out of the NAT tables.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

use crate::common::{Four, Latch, Stream};

/// Splice buffer size per direction.
const SPLICE_BUFFER_SIZE: usize = 2048;

/// Removes a finished flow from the NAT tables. Implemented by the split
/// engine, which strictly outlives every flow it plants.
#[async_trait]
pub trait Plant: Send + Sync {
    async fn pull(&self, four: &Four);
}

/// One NAT-ed TCP session.
pub struct Flow {
    four: Four,
    latch: Latch,
    /// Populated by the upstream connect task, taken when the acceptor
    /// yields the reciprocating socket.
    up: Mutex<Option<Stream>>,
}

impl Flow {
    pub fn new(four: Four) -> Self {
        Self {
            four,
            latch: Latch::new(2),
            up: Mutex::new(None),
        }
    }

    pub fn four(&self) -> Four {
        self.four
    }

    pub fn set_up(&self, stream: Stream) {
        *self.up.lock().unwrap() = Some(stream);
    }

    fn take_up(&self) -> Option<Stream> {
        self.up.lock().unwrap().take()
    }

    /// Launch both splice directions plus the watcher that pulls this flow
    /// from the plant once both sides have shut down.
    ///
    /// Returns false if no upstream stream was ever attached (the connect
    /// failed while the host kernel was still dialing); the caller just
    /// drops the accepted socket.
    pub fn open(self: &Arc<Self>, plant: Arc<dyn Plant>, down: Stream) -> bool {
        let Some(up) = self.take_up() else {
            return false;
        };

        let (up_read, up_write) = tokio::io::split(up);
        let (down_read, down_write) = tokio::io::split(down);
        splice(up_read, down_write, Arc::clone(self));
        splice(down_read, up_write, Arc::clone(self));

        let flow = Arc::clone(self);
        tokio::spawn(async move {
            flow.latch.wait().await;
            trace!("flow {} finished", flow.four);
            plant.pull(&flow.four).await;
        });
        true
    }
}

/// One splice direction: copy until EOF or error, then shut the output.
fn splice(mut input: ReadHalf<Stream>, mut output: WriteHalf<Stream>, flow: Arc<Flow>) {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; SPLICE_BUFFER_SIZE];
        loop {
            let size = match input.read(&mut buffer).await {
                Ok(0) => break,
                Ok(size) => size,
                Err(_) => break,
            };
            if output.write_all(&buffer[..size]).await.is_err() {
                break;
            }
            if output.flush().await.is_err() {
                break;
            }
        }
        let _ = output.shutdown().await;
        flow.latch.count_down();
    });
}
